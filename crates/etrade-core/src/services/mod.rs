//! Read-only views over account and market data, shaped from E*TRADE's JSON.

mod accounts;
mod models;
mod quotes;

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;

pub use accounts::AccountService;
pub use models::{Account, Balance, Portfolio, Position, Quote};
pub use quotes::{QuoteService, MAX_QUOTE_SYMBOLS};

// E*TRADE returns a bare object where a one-element list is expected.
fn one_or_many(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(item @ Value::Object(_)) => vec![item],
        _ => Vec::new(),
    }
}

fn field<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(key))
}

fn string(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Numeric field as a decimal. Absent or unparseable values become `None`.
fn decimal(value: &Value, key: &str) -> Option<Decimal> {
    let raw = match value.get(key)? {
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.trim().to_owned(),
        _ => return None,
    };
    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .ok()
}

fn integer(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}
