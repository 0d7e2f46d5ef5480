//! Canonical JSON serialization and digest computation (RFC 8785-class).
//!
//! - object keys ordered by UTF-16 code units (§3.2.3)
//! - integer-valued floats written as integers
//! - compact output, no insignificant whitespace
//!
//! The writer emits the canonical text directly instead of rebuilding a
//! `serde_json::Map`, whose own iteration order is UTF-8 byte order.

use serde_json::Value;
use stagegate_state::ContentDigest;

use crate::error::{GateError, Result};

fn utf16_order(a: &str, b: &str) -> std::cmp::Ordering {
    a.encode_utf16().cmp(b.encode_utf16())
}

fn write_number(n: &serde_json::Number, out: &mut String) -> Result<()> {
    if n.is_i64() || n.is_u64() {
        out.push_str(&n.to_string());
        return Ok(());
    }
    let f = n
        .as_f64()
        .ok_or_else(|| GateError::InvalidPayload(format!("unrepresentable number {n}")))?;
    if !f.is_finite() {
        return Err(GateError::InvalidPayload(
            "NaN/Infinity not permitted in canonical JSON".to_string(),
        ));
    }
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        out.push_str(&(f as i64).to_string());
    } else {
        out.push_str(&n.to_string());
    }
    Ok(())
}

fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| utf16_order(a, b));
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(&map[key.as_str()], out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Number(n) => write_number(n, out)?,
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

/// Canonical text of a JSON value.
pub fn canonical_json(value: &Value) -> Result<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

/// SHA-256 of the canonical text.
pub fn compute_digest(value: &Value) -> Result<ContentDigest> {
    let canonical = canonical_json(value)?;
    Ok(ContentDigest::from_bytes(canonical.as_bytes()))
}
