// ── Value coercion ──
//
// Appliances are loose about value encodings: integers arrive as floats
// or strings, booleans as 0/1, objects as embedded JSON text. Every
// value crossing into an entity -- a caller's write or an inbound update
// -- is normalised against the entity's protocol type first.
//
// Coercion is total: input that cannot be interpreted passes through
// unchanged rather than failing, so a lossy firmware quirk never drops
// an update.

use serde_json::Value;

use crate::describe::ProtocolType;

/// Normalise `value` to `protocol_type`. An absent type passes the value
/// through untouched.
pub fn coerce(protocol_type: Option<ProtocolType>, value: &Value) -> Value {
    let Some(ty) = protocol_type else {
        return value.clone();
    };
    match ty {
        ProtocolType::Boolean => Value::Bool(coerce_bool(value)),
        ProtocolType::Integer => coerce_integer(value),
        ProtocolType::Float => coerce_float(value),
        ProtocolType::String => coerce_string(value),
        ProtocolType::Object => coerce_object(value),
    }
}

fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => true,
            "false" => false,
            other => other
                .parse::<f64>()
                .map(|f| f != 0.0)
                .unwrap_or_else(|_| truthy(value)),
        },
        other => truthy(other),
    }
}

fn coerce_integer(value: &Value) -> Value {
    match value {
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                value.clone()
            } else {
                match n.as_f64() {
                    Some(f) => Value::from(f as i64),
                    None => value.clone(),
                }
            }
        }
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
                .map(Value::from)
                .unwrap_or_else(|| value.clone())
        }
        Value::Bool(b) => Value::from(i64::from(*b)),
        _ => value.clone(),
    }
}

fn coerce_float(value: &Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) => Value::from(f),
            None => value.clone(),
        },
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .map(Value::from)
            .unwrap_or_else(|| value.clone()),
        Value::Bool(b) => Value::from(if *b { 1.0 } else { 0.0 }),
        _ => value.clone(),
    }
}

fn coerce_string(value: &Value) -> Value {
    match value {
        Value::String(_) => value.clone(),
        other => Value::String(other.to_string()),
    }
}

fn coerce_object(value: &Value) -> Value {
    match value {
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| value.clone()),
        other => other.clone(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
