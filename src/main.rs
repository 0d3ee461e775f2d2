mod backup;
mod categories;
mod cli;
mod config;
mod db;
mod error;
mod items;
mod ledger;
mod search;
mod validate;

use cli::Cli;
use log::{debug, error};

fn main() {
    if let Err(err) = Cli::handle_command_line() {
        debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());
        error!("{:?}", err);
        eprintln!("{}", err);
        std::process::exit(err.exit_code());
    }
}
