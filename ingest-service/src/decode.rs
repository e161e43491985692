//! Request body decoding.
//!
//! The body is forwarded untouched; decoding only establishes that it is UTF-8
//! text describing a transaction item.

use serde::de::{Deserializer, Error as _};
use serde::Deserialize;
use serde_json::{Number, Value};

use crate::error::DecodeError;

/// A sold item, as submitted to `POST /post-data`. Extra fields are allowed.
///
/// Numbers are accepted leniently: `price` may be a numeric string, and
/// `quantity` may be a whole float (`3.0`) or an integer string (`"3"`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Item {
    pub name: String,
    #[serde(deserialize_with = "lenient_float")]
    pub price: f64,
    #[serde(deserialize_with = "lenient_int")]
    pub quantity: i64,
}

fn lenient_float<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| D::Error::custom("price is not a finite number")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .ok_or_else(|| D::Error::custom(format!("price '{s}' is not a number"))),
        other => Err(D::Error::custom(format!("price must be a number, got {other}"))),
    }
}

fn lenient_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => whole_number(&n)
            .ok_or_else(|| D::Error::custom(format!("quantity {n} is not a whole number"))),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| D::Error::custom(format!("quantity '{s}' is not an integer"))),
        other => Err(D::Error::custom(format!("quantity must be an integer, got {other}"))),
    }
}

fn whole_number(n: &Number) -> Option<i64> {
    if let Some(i) = n.as_i64() {
        return Some(i);
    }
    let f = n.as_f64()?;
    let in_range = f >= i64::MIN as f64 && f < i64::MAX as f64;
    (f.fract() == 0.0 && in_range).then_some(f as i64)
}

/// Interpret `body` as UTF-8 text.
pub fn decode(body: &[u8]) -> Result<String, DecodeError> {
    Ok(std::str::from_utf8(body)?.to_owned())
}

/// Check that `text` is a JSON item.
pub fn validate_item(text: &str) -> Result<Item, DecodeError> {
    serde_json::from_str(text).map_err(DecodeError::InvalidItem)
}
