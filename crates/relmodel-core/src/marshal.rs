//! Attribute marshalling across the executor boundary.

use crate::error::{Error, Result, TypeError};
use crate::schema::ModelDef;
use crate::value::Value;

/// Converts attribute values to and from their stored form.
pub trait AttributeMarshaller: Send + Sync {
    /// Attribute value -> value handed to the executor.
    fn encode(&self, model: &ModelDef, column: &str, value: Value) -> Result<Value>;

    /// Value read from the executor -> attribute value.
    fn decode(&self, model: &ModelDef, column: &str, value: Value) -> Result<Value>;
}

/// Stores JSON columns as text and normalizes booleans.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMarshaller;

fn is_json(db_type: &str) -> bool {
    db_type.eq_ignore_ascii_case("json") || db_type.eq_ignore_ascii_case("jsonb")
}

fn is_bool(db_type: &str) -> bool {
    db_type.eq_ignore_ascii_case("boolean") || db_type.eq_ignore_ascii_case("bool")
}

impl AttributeMarshaller for DefaultMarshaller {
    fn encode(&self, model: &ModelDef, column: &str, value: Value) -> Result<Value> {
        let Some(def) = model.column(column) else {
            return Ok(value);
        };
        match value {
            Value::Json(json) if is_json(&def.db_type) => Ok(Value::Text(serde_json::to_string(&json)?)),
            other => Ok(other),
        }
    }

    fn decode(&self, model: &ModelDef, column: &str, value: Value) -> Result<Value> {
        let Some(def) = model.column(column) else {
            return Ok(value);
        };
        if is_json(&def.db_type) {
            return match value {
                Value::Text(text) => Ok(Value::Json(serde_json::from_str(&text)?)),
                other => Ok(other),
            };
        }
        if is_bool(&def.db_type) {
            return match value {
                Value::Null | Value::Bool(_) => Ok(value),
                Value::Int(_) | Value::BigInt(_) => Ok(Value::Bool(value.as_bool().unwrap_or(false))),
                Value::Text(ref text) => match text.as_str() {
                    "t" | "true" | "1" => Ok(Value::Bool(true)),
                    "f" | "false" | "0" => Ok(Value::Bool(false)),
                    _ => Err(Error::Type(TypeError {
                        expected: "boolean",
                        actual: format!("'{}'", text),
                        column: Some(column.to_string()),
                    })),
                },
                other => Err(Error::Type(TypeError {
                    expected: "boolean",
                    actual: other.type_name().to_string(),
                    column: Some(column.to_string()),
                })),
            };
        }
        Ok(value)
    }
}
