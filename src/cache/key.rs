use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Builds `endpoint:canonical-json(args)`.
///
/// Object keys are emitted in sorted order at every depth, so two value-equal
/// argument sets always produce the same key whatever their field or map order.
pub fn cache_key<A: Serialize + ?Sized>(endpoint: &str, args: &A) -> Result<String> {
    let value = serde_json::to_value(args)?;
    let mut key = String::with_capacity(endpoint.len() + 32);
    key.push_str(endpoint);
    key.push(':');
    write_canonical(&value, &mut key);
    Ok(key)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Re-serialize the key so quotes and escapes match JSON.
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(&map[k.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
