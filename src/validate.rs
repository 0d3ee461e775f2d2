use chrono::NaiveDate;

use crate::error::StockPulseError;

pub const MAX_NAME_LENGTH: usize = 100;
pub const MAX_CATEGORY_LENGTH: usize = 50;
pub const MAX_SHOP_LENGTH: usize = 50;
/// Largest quantity a single movement may carry.
pub const MAX_QUANTITY: i64 = 99_999;

const ISO_FORMAT: &str = "%Y-%m-%d";
const LOCALE_FORMAT: &str = "%d.%m.%Y";

pub fn item_name(name: &str) -> Result<String, StockPulseError> {
    bounded("Name", name, MAX_NAME_LENGTH)
}

pub fn category_name(name: &str) -> Result<String, StockPulseError> {
    bounded("Category name", name, MAX_CATEGORY_LENGTH)
}

pub fn shop(value: Option<&str>) -> Result<Option<String>, StockPulseError> {
    match non_blank(value) {
        Some(s) => bounded("Shop", s, MAX_SHOP_LENGTH).map(Some),
        None => Ok(None),
    }
}

pub fn note(value: Option<&str>) -> Option<String> {
    non_blank(value).map(str::to_owned)
}

/// Accepts `YYYY-MM-DD` or `DD.MM.YYYY` and returns the ISO form.
/// Blank input means "no date".
pub fn date(field: &str, value: Option<&str>) -> Result<Option<String>, StockPulseError> {
    let Some(s) = non_blank(value) else {
        return Ok(None);
    };

    parse_date(s)
        .map(|d| Some(d.format(ISO_FORMAT).to_string()))
        .ok_or_else(|| {
            StockPulseError::ValidationError(format!(
                "{} '{}' must be a valid date in the form YYYY-MM-DD or DD.MM.YYYY",
                field, s
            ))
        })
}

/// Parses a date in either accepted shape. The shape is checked before
/// handing off to chrono, which would otherwise accept single-digit fields.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    let bytes = s.as_bytes();
    if bytes.len() != 10 {
        return None;
    }

    let digits_at = |positions: &[usize]| positions.iter().all(|&i| bytes[i].is_ascii_digit());

    if bytes[4] == b'-' && bytes[7] == b'-' && digits_at(&[0, 1, 2, 3, 5, 6, 8, 9]) {
        NaiveDate::parse_from_str(s, ISO_FORMAT).ok()
    } else if bytes[2] == b'.' && bytes[5] == b'.' && digits_at(&[0, 1, 3, 4, 6, 7, 8, 9]) {
        NaiveDate::parse_from_str(s, LOCALE_FORMAT).ok()
    } else {
        None
    }
}

pub fn quantity(quantity: i64) -> Result<i64, StockPulseError> {
    if quantity <= 0 {
        return Err(StockPulseError::ValidationError(format!(
            "Quantity must be positive, got {}",
            quantity
        )));
    }
    if quantity > MAX_QUANTITY {
        return Err(StockPulseError::ValidationError(format!(
            "Quantity {} is too large (max {})",
            quantity, MAX_QUANTITY
        )));
    }
    Ok(quantity)
}

fn bounded(field: &str, value: &str, max: usize) -> Result<String, StockPulseError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(StockPulseError::ValidationError(format!(
            "{} must not be empty",
            field
        )));
    }
    if trimmed.chars().count() > max {
        return Err(StockPulseError::ValidationError(format!(
            "{} is too long (max {} characters)",
            field, max
        )));
    }
    Ok(trimmed.to_owned())
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}
