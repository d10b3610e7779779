//! InfluxDB Line Protocol encoding.
//!
//! ```text
//! measurement,tag1=val1,tag2=val2 field1=val1,field2=val2 timestamp_s
//! ```
//!
//! Points are written with `precision=s`, so the trailing timestamp is in
//! Unix seconds.

use std::fmt;

use super::Point;

/// A value that can be stored in an InfluxDB field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// 64-bit floating point.
    Float(f64),
    /// 64-bit signed integer.
    Integer(i64),
    /// UTF-8 string.
    String(String),
    /// Boolean value.
    Boolean(bool),
}

impl FieldValue {
    /// Format this value for Line Protocol.
    ///
    /// - Float: written as-is (e.g., `3.14`)
    /// - Integer: suffixed with `i` (e.g., `42i`)
    /// - String: double-quoted with `\` and `"` escaped
    /// - Boolean: `true` or `false`
    pub fn to_line_protocol(&self) -> String {
        match self {
            FieldValue::Float(v) => format!("{}", v),
            FieldValue::Integer(v) => format!("{}i", v),
            FieldValue::String(v) => {
                let escaped = v.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{}\"", escaped)
            }
            FieldValue::Boolean(v) => v.to_string(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line_protocol())
    }
}

/// Encode one point. Tags come out sorted by key (they live in a `BTreeMap`).
///
/// A point without fields is not valid Line Protocol; callers always build
/// at least one field.
pub fn encode(point: &Point) -> String {
    let mut line = escape_measurement(&point.measurement);

    for (key, value) in &point.tags {
        line.push(',');
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&escape_key(value));
    }

    line.push(' ');

    for (i, (key, value)) in point.fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&value.to_line_protocol());
    }

    line.push(' ');
    line.push_str(&point.timestamp.to_string());
    line
}

/// Spaces and commas are escaped in measurement names.
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Tag keys, tag values and field keys escape commas, equals signs and spaces.
///
/// Line breaks and tabs cannot appear in a line and become escaped spaces.
/// Trailing backslashes are dropped so they cannot escape the separator
/// that follows.
fn escape_key(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.trim_end_matches('\\').chars() {
        match c {
            ',' | '=' | ' ' => {
                escaped.push('\\');
                escaped.push(c);
            }
            '\n' | '\r' | '\t' => escaped.push_str("\\ "),
            _ => escaped.push(c),
        }
    }
    escaped
}
