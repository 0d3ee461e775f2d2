use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use directories::ProjectDirs;
use flexi_logger::{
    detailed_format, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming,
};
use log::{info, warn};
use serde::Serialize;

use crate::backup::Backup;
use crate::categories::Category;
use crate::config::Config;
use crate::db::migration::Migrator;
use crate::db::Database;
use crate::error::StockPulseError;
use crate::items::{format_item_id, parse_item_id, Item, ItemFilter, ItemStatus, ItemUpdate, NewItem};
use crate::ledger::{Ledger, MovementKind};
use crate::search::SearchIndex;

#[derive(Parser, Debug)]
#[command(
    name = "stockpulse",
    version,
    about = "StockPulse: parts inventory with an append-only stock ledger"
)]
pub struct Cli {
    /// Store file (overrides `database.path` from the config file)
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add, inspect, change or remove items
    Item {
        #[command(subcommand)]
        command: ItemCommand,
    },

    /// Manage categories
    Category {
        #[command(subcommand)]
        command: CategoryCommand,
    },

    /// Record and inspect stock movements
    Stock {
        #[command(subcommand)]
        command: StockCommand,
    },

    /// Full-text search over item name, category, shop and note
    Search {
        /// FTS query; falls back to a substring match
        query: String,
    },

    /// Rebuild the search index from the item table
    Reindex,

    /// Copy the store to a file
    Export {
        dest: PathBuf,
    },

    /// Replace the store with a previously exported file (the current store is backed up first)
    Import {
        source: PathBuf,
    },

    /// Show the schema version of the store
    Schema,
}

#[derive(Args, Debug)]
pub struct ItemFields {
    /// Category label (created if it does not exist)
    #[arg(long)]
    pub category: Option<String>,

    #[arg(long)]
    pub shop: Option<String>,

    #[arg(long)]
    pub note: Option<String>,

    /// Order date (YYYY-MM-DD)
    #[arg(long = "ordered-on", value_name = "DATE")]
    pub ordered_on: Option<String>,

    /// Arrival date (YYYY-MM-DD)
    #[arg(long = "arrived-on", value_name = "DATE")]
    pub arrived_on: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum ItemCommand {
    Add {
        name: String,

        #[arg(long, value_parser = parse_status, default_value = "ordered")]
        status: ItemStatus,

        #[command(flatten)]
        fields: ItemFields,
    },

    /// Show an item with its stock level and latest movements
    Show {
        #[arg(value_parser = parse_id)]
        id: i64,

        /// Number of movements to show
        #[arg(long, short = 'n', default_value_t = 10)]
        movements: usize,
    },

    List {
        /// Only items in this category
        #[arg(long)]
        category: Option<String>,

        #[arg(long, value_parser = parse_status)]
        status: Option<ItemStatus>,
    },

    /// Change fields of an item. Pass an empty string to clear shop, note or a date
    Update {
        #[arg(value_parser = parse_id)]
        id: i64,

        #[arg(long)]
        name: Option<String>,

        #[arg(long, value_parser = parse_status)]
        status: Option<ItemStatus>,

        #[command(flatten)]
        fields: ItemFields,
    },

    /// Delete an item and its ledger rows
    Remove {
        #[arg(value_parser = parse_id)]
        id: i64,
    },
}

#[derive(Subcommand, Debug)]
pub enum CategoryCommand {
    Add {
        name: String,
    },

    /// List categories with their item counts
    List,

    Rename {
        /// Category name or id
        category: String,
        new_name: String,
    },

    /// Delete a category no item refers to
    Remove {
        /// Category name or id
        category: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum StockCommand {
    /// Append a movement to the ledger
    Record {
        #[arg(value_parser = parse_id)]
        id: i64,

        /// inbound, outbound, ordered, cancelled, defective or consumed_in_project
        #[arg(value_parser = parse_kind)]
        kind: MovementKind,

        #[arg(allow_negative_numbers = true)]
        quantity: i64,

        #[arg(long)]
        note: Option<String>,

        /// Date the movement refers to (YYYY-MM-DD)
        #[arg(long, value_name = "DATE")]
        date: Option<String>,
    },

    /// Show stock levels for one item or all items
    Show {
        #[arg(value_parser = parse_id)]
        id: Option<i64>,
    },

    /// List items at or below a stock threshold
    Low {
        /// Defaults to `stock.low_threshold` from the config file
        #[arg(long, short = 't')]
        threshold: Option<i64>,
    },

    /// Check the SQL aggregate of every item against its ledger rows
    Verify,
}

fn parse_id(s: &str) -> Result<i64, String> {
    parse_item_id(s).map_err(|e| e.to_string())
}

fn parse_status(s: &str) -> Result<ItemStatus, String> {
    ItemStatus::parse(s).map_err(|e| e.to_string())
}

fn parse_kind(s: &str) -> Result<MovementKind, String> {
    MovementKind::parse(s).map_err(|e| e.to_string())
}

/// `None` leaves the field alone, an empty string clears it.
fn clearable(value: Option<String>) -> Option<Option<String>> {
    value.map(|v| if v.trim().is_empty() { None } else { Some(v) })
}

fn print_json<T: Serialize>(value: &T) -> Result<(), StockPulseError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| StockPulseError::Error(format!("Failed to serialize output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

fn print_item(item: &Item) {
    println!("{}  {}", item.display_id(), item.name);
    println!("  category:   {}", item.category_name);
    println!("  status:     {}", item.status);
    if let Some(shop) = &item.shop {
        println!("  shop:       {}", shop);
    }
    if let Some(ordered_on) = &item.ordered_on {
        println!("  ordered on: {}", ordered_on);
    }
    if let Some(arrived_on) = &item.arrived_on {
        println!("  arrived on: {}", arrived_on);
    }
    if let Some(note) = &item.note {
        println!("  note:       {}", note);
    }
}

fn print_item_row(item: &Item) {
    println!(
        "{}  {:<10} {:<20} {}",
        item.display_id(),
        item.status,
        item.category_name,
        item.name
    );
}

#[derive(Serialize)]
struct ItemDetail<'a> {
    #[serde(flatten)]
    item: &'a Item,
    stock: crate::ledger::StockLevel,
    movements: Vec<crate::ledger::StockMovement>,
}

#[derive(Serialize)]
struct SchemaStatus {
    path: PathBuf,
    schema_version: u32,
    latest_version: u32,
    search_out_of_sync: Vec<i64>,
}

impl Cli {
    pub fn handle_command_line() -> Result<(), StockPulseError> {
        let args = Cli::parse();

        let project_dirs = ProjectDirs::from("", "", "stockpulse").ok_or_else(|| {
            StockPulseError::Error("Could not determine the data directory".into())
        })?;

        let config = Config::load_config(&project_dirs);
        // Held for the life of the process; dropping it stops file logging
        let _logger = Self::setup_logging(&project_dirs, &config)?;

        let db_path = args
            .db
            .clone()
            .unwrap_or_else(|| config.database_path(&project_dirs));

        info!("stockpulse {:?} on '{}'", args.command, db_path.display());

        args.run(&config, &db_path)
    }

    fn setup_logging(
        project_dirs: &ProjectDirs,
        config: &Config,
    ) -> Result<LoggerHandle, StockPulseError> {
        let log_dir = project_dirs.data_local_dir().join("logs");

        Logger::try_with_str(format!("stockpulse={}", config.logging.stockpulse))
            .map_err(|e| StockPulseError::Error(format!("Invalid log specification: {}", e)))?
            .log_to_file(FileSpec::default().directory(log_dir).basename("stockpulse"))
            .rotate(
                Criterion::Size(1_000_000),
                Naming::Timestamps,
                Cleanup::KeepLogFiles(7),
            )
            .duplicate_to_stderr(Duplicate::Warn)
            .format_for_files(detailed_format)
            .start()
            .map_err(|e| StockPulseError::Error(format!("Failed to start logger: {}", e)))
    }

    fn run(self, config: &Config, db_path: &Path) -> Result<(), StockPulseError> {
        let json = self.json;

        // Export and import work on the file itself and must not migrate it first
        match self.command {
            Command::Export { dest } => {
                let bytes = Backup::export(db_path, &dest)?;
                println!("Exported {} bytes to {}", bytes, dest.display());
                return Ok(());
            }
            Command::Import { source } => {
                let report = Backup::import(db_path, &source)?;
                if json {
                    return print_json(&report);
                }
                if let Some(backup) = &report.backup_path {
                    println!("Previous store saved to {}", backup.display());
                }
                println!(
                    "Imported {} (schema version {} -> {})",
                    source.display(),
                    report.source_version,
                    report.schema_version
                );
                return Ok(());
            }
            command => {
                let db = Database::open(db_path)?;
                Self::dispatch(&db, config, command, json)
            }
        }
    }

    fn dispatch(
        db: &Database,
        config: &Config,
        command: Command,
        json: bool,
    ) -> Result<(), StockPulseError> {
        match command {
            Command::Item { command } => Self::item(db, command, json),
            Command::Category { command } => Self::category(db, command, json),
            Command::Stock { command } => Self::stock(db, config, command, json),
            Command::Search { query } => {
                let conn = db.get_connection()?;
                let result = SearchIndex::search(&conn, &query)?;
                if json {
                    return print_json(&result);
                }
                if result.items.is_empty() {
                    println!("No items match '{}'", query);
                }
                result.items.iter().for_each(print_item_row);
                Ok(())
            }
            Command::Reindex => {
                let conn = db.get_connection()?;
                let indexed = SearchIndex::rebuild(&conn)?;
                println!("Indexed {} item(s)", indexed);
                Ok(())
            }
            Command::Schema => {
                let conn = db.get_connection()?;
                let (schema_version, latest_version) = Migrator::status(&conn)?;
                let status = SchemaStatus {
                    path: db.path().to_owned(),
                    schema_version,
                    latest_version,
                    search_out_of_sync: SearchIndex::verify(&conn)?,
                };
                if json {
                    return print_json(&status);
                }
                println!("Store:          {}", status.path.display());
                println!("Schema version: {} (latest {})", schema_version, latest_version);
                if !status.search_out_of_sync.is_empty() {
                    println!(
                        "Search index out of sync for {} item(s); run `stockpulse reindex`",
                        status.search_out_of_sync.len()
                    );
                }
                Ok(())
            }
            Command::Export { .. } | Command::Import { .. } => Err(StockPulseError::Error(
                "Export and import do not open the store".into(),
            )),
        }
    }

    fn item(db: &Database, command: ItemCommand, json: bool) -> Result<(), StockPulseError> {
        let conn = db.get_connection()?;

        match command {
            ItemCommand::Add {
                name,
                status,
                fields,
            } => {
                let item = Item::create(
                    &conn,
                    &NewItem {
                        name,
                        category: fields.category,
                        status,
                        shop: fields.shop,
                        note: fields.note,
                        ordered_on: fields.ordered_on,
                        arrived_on: fields.arrived_on,
                    },
                )?;
                if json {
                    return print_json(&item);
                }
                println!("Added item {}", item.display_id());
            }
            ItemCommand::Show { id, movements } => {
                let item = Item::get_required(&conn, id)?;
                let detail = ItemDetail {
                    item: &item,
                    stock: Ledger::stock_level(&conn, id)?,
                    movements: Ledger::recent_movements(&conn, id, movements)?,
                };
                if json {
                    return print_json(&detail);
                }
                print_item(&item);
                println!(
                    "  stock:      {} on hand, {} ordered, {} consumed, {} defective",
                    detail.stock.current_stock,
                    detail.stock.ordered_quantity,
                    detail.stock.consumed_quantity,
                    detail.stock.defective_quantity
                );
                for m in &detail.movements {
                    println!(
                        "    {}  {:<20} {:>6}  {}",
                        m.recorded_at,
                        m.kind,
                        m.quantity,
                        m.note.as_deref().unwrap_or("")
                    );
                }
            }
            ItemCommand::List { category, status } => {
                let items = Item::list(&conn, &ItemFilter { category, status })?;
                if json {
                    return print_json(&items);
                }
                items.iter().for_each(print_item_row);
            }
            ItemCommand::Update {
                id,
                name,
                status,
                fields,
            } => {
                let update = ItemUpdate {
                    name,
                    category: fields.category,
                    status,
                    shop: clearable(fields.shop),
                    note: clearable(fields.note),
                    ordered_on: clearable(fields.ordered_on),
                    arrived_on: clearable(fields.arrived_on),
                };
                if update.is_empty() {
                    return Err(StockPulseError::ValidationError(
                        "Nothing to update".into(),
                    ));
                }
                let item = Item::update(&conn, id, &update)?;
                if json {
                    return print_json(&item);
                }
                println!("Updated item {}", item.display_id());
            }
            ItemCommand::Remove { id } => {
                let purged = Item::delete(&conn, id)?;
                println!(
                    "Removed item {} and {} movement(s)",
                    format_item_id(id),
                    purged
                );
            }
        }

        Ok(())
    }

    fn category(db: &Database, command: CategoryCommand, json: bool) -> Result<(), StockPulseError> {
        let conn = db.get_connection()?;

        match command {
            CategoryCommand::Add { name } => {
                let category = Category::create(&conn, &name)?;
                if json {
                    return print_json(&category);
                }
                println!("Added category {} '{}'", category.category_id, category.name);
            }
            CategoryCommand::List => {
                let categories = Category::list(&conn)?;
                if json {
                    return print_json(&categories);
                }
                for usage in categories {
                    println!(
                        "{:>4}  {:<30} {:>5} item(s)",
                        usage.category.category_id, usage.category.name, usage.item_count
                    );
                }
            }
            CategoryCommand::Rename { category, new_name } => {
                let current = Category::find(&conn, &category)?;
                let renamed = Category::rename(&conn, current.category_id, &new_name)?;
                if json {
                    return print_json(&renamed);
                }
                println!("Renamed '{}' to '{}'", current.name, renamed.name);
            }
            CategoryCommand::Remove { category } => {
                let current = Category::find(&conn, &category)?;
                Category::delete(&conn, current.category_id)?;
                println!("Removed category '{}'", current.name);
            }
        }

        Ok(())
    }

    fn stock(
        db: &Database,
        config: &Config,
        command: StockCommand,
        json: bool,
    ) -> Result<(), StockPulseError> {
        let conn = db.get_connection()?;

        match command {
            StockCommand::Record {
                id,
                kind,
                quantity,
                note,
                date,
            } => {
                let movement_id = Ledger::record_movement(
                    &conn,
                    id,
                    kind,
                    quantity,
                    note.as_deref(),
                    date.as_deref(),
                )?;
                let current = Ledger::current_stock(&conn, id)?;
                println!(
                    "Recorded {} x{} for item {} (movement {}); stock now {}",
                    kind,
                    quantity,
                    format_item_id(id),
                    movement_id,
                    current
                );
            }
            StockCommand::Show { id } => {
                let levels = match id {
                    Some(id) => vec![Ledger::stock_level(&conn, id)?],
                    None => Ledger::stock_levels(&conn)?,
                };
                if json {
                    return print_json(&levels);
                }
                println!(
                    "{:<8} {:>8} {:>8} {:>8} {:>8}",
                    "item", "stock", "ordered", "consumed", "defective"
                );
                for level in levels {
                    println!(
                        "{:<8} {:>8} {:>8} {:>8} {:>8}",
                        format_item_id(level.item_id),
                        level.current_stock,
                        level.ordered_quantity,
                        level.consumed_quantity,
                        level.defective_quantity
                    );
                }
            }
            StockCommand::Low { threshold } => {
                let threshold = threshold.unwrap_or(config.stock.low_threshold);
                let low = Ledger::low_stock(&conn, threshold)?;
                if json {
                    return print_json(&low);
                }
                if low.is_empty() {
                    println!("No items at or below {}", threshold);
                }
                for item in low {
                    println!(
                        "{}  {:>6}  {}",
                        format_item_id(item.item_id),
                        item.current_stock,
                        item.name
                    );
                }
            }
            StockCommand::Verify => {
                let divergent = Ledger::verify(&conn)?;
                if json {
                    print_json(&divergent)?;
                } else {
                    for d in &divergent {
                        println!(
                            "{}: aggregate {} != ledger {}",
                            format_item_id(d.item_id),
                            d.aggregated.current_stock,
                            d.recomputed.current_stock
                        );
                    }
                }
                if !divergent.is_empty() {
                    warn!("Ledger verification found {} divergent item(s)", divergent.len());
                    return Err(StockPulseError::Error(format!(
                        "{} item(s) disagree with their ledger rows",
                        divergent.len()
                    )));
                }
                if !json {
                    println!("Ledger consistent");
                }
            }
        }

        Ok(())
    }
}
