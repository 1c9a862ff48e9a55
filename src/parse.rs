// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jesof

//! Typed coercion of string-valued rows
//!
//! RouterOS returns every attribute as a string. These helpers normalize
//! rows for consumers that want JSON-shaped data: keys lose their leading
//! `.` and become camelCase, `true`/`yes` and `false`/`no` become booleans,
//! and numeric-looking values become numbers. IP addresses and dotted
//! version strings stay strings.

use serde_json::{Map, Number, Value};

use crate::protocol::Row;

/// Coerce one raw attribute value.
#[must_use]
pub fn parse_value(raw: &str) -> Value {
    match raw {
        "true" | "yes" => return Value::Bool(true),
        "false" | "no" => return Value::Bool(false),
        _ => {}
    }
    if looks_numeric(raw) {
        if let Ok(int) = raw.parse::<i64>() {
            return Value::Number(Number::from(int));
        }
        if let Ok(float) = raw.parse::<f64>() {
            if let Some(number) = Number::from_f64(float) {
                return Value::Number(number);
            }
        }
    }
    Value::String(raw.to_string())
}

/// Numeric-looking: digits with at most one `.`, optionally signed.
/// Two or more dots (IPs, versions) disqualify.
fn looks_numeric(raw: &str) -> bool {
    let unsigned = raw.strip_prefix('-').unwrap_or(raw);
    if unsigned.is_empty() {
        return false;
    }
    let mut dots = 0;
    for c in unsigned.chars() {
        match c {
            '.' => dots += 1,
            '0'..='9' => {}
            _ => return false,
        }
    }
    dots <= 1 && unsigned.chars().any(|c| c.is_ascii_digit())
}

/// Convert one row: typed values under normalized keys.
#[must_use]
pub fn parse_row(row: &Row) -> Map<String, Value> {
    row.iter()
        .map(|(key, value)| (normalize_key(key), parse_value(value)))
        .collect()
}

/// Convert a whole result set.
#[must_use]
pub fn parse_rows(rows: &[Row]) -> Vec<Map<String, Value>> {
    rows.iter().map(parse_row).collect()
}

/// Strip the leading `.` and convert kebab-case to camelCase.
#[must_use]
pub fn normalize_key(key: &str) -> String {
    let key = key.strip_prefix('.').unwrap_or(key);
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for c in key.chars() {
        if c == '-' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}
