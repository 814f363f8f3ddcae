//! # Canonical Encoding
//!
//! Block hashes are computed over a byte string, and the same logical block
//! must produce the same bytes forever: across processes, platforms, serde
//! feature flags, and any number of save/reload cycles. This module owns
//! that byte string.
//!
//! ## Rules
//!
//! - Objects: keys sorted by code point, written as `{"k":v,"k2":v2}`.
//!   Sorting happens here, never by trusting the map's iteration order.
//! - Separators: `,` between items and `:` between key and value. No
//!   whitespace anywhere.
//! - Strings: `"` and `\` escaped, control characters use the short escapes
//!   (`\n`, `\t`, ...) or `\u00XX`, and every non-ASCII code point is written
//!   as `\uXXXX` (surrogate pairs above the BMP). Output is pure ASCII.
//! - Numbers: serde_json's shortest round-trip representation.
//!
//! This is the `sort_keys`, compact-separator, ASCII-only JSON convention.

use serde_json::{Map, Value};

/// Encode a JSON value canonically.
pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::with_capacity(128);
    write_value(&mut out, value);
    out
}

/// Canonical encoding as bytes. Always valid ASCII.
pub fn to_canonical_bytes(value: &Value) -> Vec<u8> {
    to_canonical_string(value).into_bytes()
}

/// Append the canonical encoding of `value` to `out`.
pub fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => write_object(out, map),
    }
}

fn write_object(out: &mut String, map: &Map<String, Value>) {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

    out.push('{');
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(out, key);
        out.push(':');
        write_value(out, value);
    }
    out.push('}');
}

/// Append `s` as a quoted, escaped, ASCII-only JSON string.
pub fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => push_unicode_escape(out, c as u16),
            c if c.is_ascii() => out.push(c),
            c => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    push_unicode_escape(out, *unit);
                }
            }
        }
    }
    out.push('"');
}

fn push_unicode_escape(out: &mut String, unit: u16) {
    out.push_str(&format!("\\u{:04x}", unit));
}
