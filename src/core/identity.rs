//! Payload Identity Hashing
//!
//! Two emits land in the same merge slot when trail, type, and the canonical
//! digest of their payloads agree. The canonical form sorts mapping keys
//! recursively, preserves array order, and writes exact whole numbers as
//! integers, so equivalent payloads hash identically across clients.
//!
//! The digest is a 16-hex-digit prefix of SHA-256 over the canonical form.
//! Collisions are possible in principle and surface as merge conflicts;
//! a known soundness gap for adversarial inputs.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt::Write;

const DIGEST_LEN: usize = 16;

/// Stable digest of a payload for merge-slot identity
pub fn payload_digest(payload: &Map<String, Value>) -> String {
    let mut canonical = String::new();
    write_map(payload, &mut canonical);

    let digest = Sha256::digest(canonical.as_bytes());
    let mut hexed = hex::encode(digest);
    hexed.truncate(DIGEST_LEN);
    hexed
}

/// Canonical serialization of an arbitrary JSON value
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => write_number(n, out),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => write_map(map, out),
    }
}

fn write_map(map: &Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    out.push('{');
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(key, out);
        out.push(':');
        if let Some(value) = map.get(*key) {
            write_value(value, out);
        }
    }
    out.push('}');
}

/// Whole-valued floats serialize as integers so 1 and 1.0 share a slot
fn write_number(n: &serde_json::Number, out: &mut String) {
    if n.is_i64() || n.is_u64() {
        out.push_str(&n.to_string());
        return;
    }
    if let Some(f) = n.as_f64() {
        if f.is_finite() && f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
            let _ = write!(out, "{}", f as i64);
            return;
        }
    }
    out.push_str(&n.to_string());
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
