//! Argument schema and coercion
//!
//! Parsing is permissive: unknown keys are ignored, `null` counts as absent,
//! and an absent argument without a default is simply missing from
//! [`ParsedArgs`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::{KilnError, Result};

/// Declared type of a workflow argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgType {
    String,
    Number,
    Boolean,
}

impl ArgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArgType::String => "string",
            ArgType::Number => "number",
            ArgType::Boolean => "boolean",
        }
    }

    /// Convert `value` to this type, or explain why it can't be
    pub fn coerce(&self, value: &Value) -> std::result::Result<Value, String> {
        match (self, value) {
            (ArgType::String, Value::String(_)) => Ok(value.clone()),
            (ArgType::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
            (ArgType::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),

            (ArgType::Number, Value::Number(_)) => Ok(value.clone()),
            (ArgType::Number, Value::String(s)) => parse_number(s.trim())
                .map(Value::Number)
                .ok_or_else(|| format!("'{}' is not a number", s)),

            (ArgType::Boolean, Value::Bool(_)) => Ok(value.clone()),
            (ArgType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str()
            {
                "true" | "yes" | "1" | "on" => Ok(Value::Bool(true)),
                "false" | "no" | "0" | "off" => Ok(Value::Bool(false)),
                _ => Err(format!("'{}' is not a boolean", s)),
            },
            (ArgType::Boolean, Value::Number(n)) => match n.as_f64() {
                Some(f) if f == 0.0 => Ok(Value::Bool(false)),
                Some(f) if f == 1.0 => Ok(Value::Bool(true)),
                _ => Err(format!("{} is not 0 or 1", n)),
            },

            (_, other) => Err(format!("got {}", kind_of(other))),
        }
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn parse_number(s: &str) -> Option<Number> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Number::from(i));
    }
    s.parse::<f64>().ok().and_then(Number::from_f64)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Declaration of one argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgSpec {
    #[serde(rename = "type")]
    pub arg_type: ArgType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ArgSpec {
    pub fn new(arg_type: ArgType) -> Self {
        Self {
            arg_type,
            alias: None,
            description: None,
            default: None,
        }
    }

    pub fn string() -> Self {
        Self::new(ArgType::String)
    }

    pub fn number() -> Self {
        Self::new(ArgType::Number)
    }

    pub fn boolean() -> Self {
        Self::new(ArgType::Boolean)
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// Arguments after schema coercion
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ParsedArgs {
    values: BTreeMap<String, Value>,
}

impl ParsedArgs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.values.get(name).and_then(Value::as_bool)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Value rendered for text substitution (strings unquoted)
    pub fn display(&self, name: &str) -> Option<String> {
        self.values.get(name).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Parse raw input against `schema`
///
/// `raw` must be a JSON object or `null`.
pub fn parse_args(
    workflow: &str,
    schema: &BTreeMap<String, ArgSpec>,
    raw: &Value,
) -> Result<ParsedArgs> {
    let empty = serde_json::Map::new();
    let input = match raw {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            return Err(KilnError::ArgValidation {
                workflow: workflow.to_string(),
                arg: "*".to_string(),
                expected: "object".to_string(),
                reason: format!("arguments must be an object, got {}", kind_of(other)),
            })
        }
    };

    let mut values = BTreeMap::new();

    for (name, spec) in schema {
        let supplied = input
            .get(name)
            .filter(|v| !v.is_null())
            .or_else(|| {
                spec.alias
                    .as_ref()
                    .and_then(|alias| input.get(alias))
                    .filter(|v| !v.is_null())
            });

        let Some(value) = supplied.or(spec.default.as_ref()) else {
            continue;
        };

        let coerced = spec
            .arg_type
            .coerce(value)
            .map_err(|reason| KilnError::ArgValidation {
                workflow: workflow.to_string(),
                arg: name.clone(),
                expected: spec.arg_type.to_string(),
                reason,
            })?;
        values.insert(name.clone(), coerced);
    }

    for key in input.keys() {
        let declared = schema.contains_key(key)
            || schema.values().any(|s| s.alias.as_deref() == Some(key.as_str()));
        if !declared {
            tracing::debug!(workflow, arg = %key, "Ignoring undeclared argument");
        }
    }

    Ok(ParsedArgs { values })
}
