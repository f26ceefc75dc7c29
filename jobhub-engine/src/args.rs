//! Raw argument input and field-level validation.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

static EMAIL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap());

/// Field name used for issues that are not tied to one field.
pub const GENERAL_FIELD: &str = "_";

/// Structured validation issue for a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub code: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(
        field: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

/// A set of validation issues, keyed by field when rendered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    issues: Vec<ValidationIssue>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(
        field: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            issues: vec![ValidationIssue::new(field, code, message)],
        }
    }

    pub fn push(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    /// Issue for `field`, if any.
    pub fn get(&self, field: &str) -> Option<&ValidationIssue> {
        self.issues.iter().find(|i| i.field == field)
    }

    /// Render as `{ "validation": { field: { code, message } } }`. The first
    /// issue recorded for a field wins.
    pub fn to_payload(&self) -> Value {
        let mut map = BTreeMap::new();
        for issue in &self.issues {
            map.entry(issue.field.clone()).or_insert_with(|| {
                serde_json::json!({ "code": issue.code, "message": issue.message })
            });
        }
        serde_json::json!({ "validation": map })
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid job arguments")?;
        for (i, issue) in self.issues.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{} {}", issue.field, issue.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

impl From<ValidationIssue> for ValidationErrors {
    fn from(issue: ValidationIssue) -> Self {
        Self {
            issues: vec![issue],
        }
    }
}

/// Argument types a job can be parameterised with.
pub trait JobArgs: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Checks that cannot be expressed by the shape of the type alone.
    fn validate(&self) -> Result<(), ValidationErrors> {
        Ok(())
    }
}

/// Decoded argument input from a form or JSON body.
///
/// Accessors are tolerant of form encoding (numbers and booleans may arrive
/// as strings, empty strings count as missing) and record an issue instead of
/// failing, so a parser can report every bad field at once.
#[derive(Debug, Default)]
pub struct RawArgs {
    fields: Map<String, Value>,
    issues: RefCell<Vec<ValidationIssue>>,
}

impl RawArgs {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            issues: RefCell::default(),
        }
    }

    /// Accepts a JSON object; `null` counts as no arguments.
    pub fn from_json(value: Value) -> Result<Self, ValidationErrors> {
        match value {
            Value::Object(map) => Ok(Self::new(map)),
            Value::Null => Ok(Self::default()),
            _ => Err(ValidationErrors::single(
                GENERAL_FIELD,
                "invalid_type",
                "arguments must be an object",
            )),
        }
    }

    /// Build from url-encoded form pairs. Later duplicates win.
    pub fn from_form<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let fields = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), Value::String(v.into())))
            .collect();
        Self::new(fields)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        match self.fields.get(field) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(v) => Some(v),
        }
    }

    /// Record an issue against `field`.
    pub fn invalid(&self, field: &str, code: &str, message: impl Into<String>) {
        self.issues
            .borrow_mut()
            .push(ValidationIssue::new(field, code, message));
    }

    fn required(&self, field: &str) -> Option<&Value> {
        let value = self.get(field);
        if value.is_none() {
            self.invalid(field, "required", format!("{field} is required"));
        }
        value
    }

    fn as_string(&self, field: &str, value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.trim().to_owned()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => {
                self.invalid(field, "invalid_type", format!("{field} must be text"));
                None
            }
        }
    }

    fn as_i64(&self, field: &str, value: &Value) -> Option<i64> {
        let parsed = match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        if parsed.is_none() {
            self.invalid(field, "invalid_number", format!("{field} must be an integer"));
        }
        parsed
    }

    pub fn required_str(&self, field: &str) -> Option<String> {
        self.required(field).and_then(|v| self.as_string(field, v))
    }

    pub fn optional_str(&self, field: &str) -> Option<String> {
        self.get(field).and_then(|v| self.as_string(field, v))
    }

    pub fn required_i64(&self, field: &str) -> Option<i64> {
        self.required(field).and_then(|v| self.as_i64(field, v))
    }

    pub fn optional_i64(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(|v| self.as_i64(field, v))
    }

    /// Checkbox semantics: a missing field is `None`, not `false`.
    pub fn optional_bool(&self, field: &str) -> Option<bool> {
        let value = self.get(field)?;
        let parsed = match value {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_i64().map(|n| n != 0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            },
            _ => None,
        };
        if parsed.is_none() {
            self.invalid(field, "invalid_bool", format!("{field} must be true or false"));
        }
        parsed
    }

    pub fn required_email(&self, field: &str) -> Option<String> {
        let value = self.required_str(field)?;
        if EMAIL_REGEX.is_match(&value) {
            Some(value)
        } else {
            self.invalid(
                field,
                "invalid_email",
                format!("{field} must be a valid email address"),
            );
            None
        }
    }

    /// An integer within `min..=max`.
    pub fn required_i64_in(&self, field: &str, min: i64, max: i64) -> Option<i64> {
        let value = self.required_i64(field)?;
        if (min..=max).contains(&value) {
            Some(value)
        } else {
            self.invalid(
                field,
                "out_of_range",
                format!("{field} must be between {min} and {max}"),
            );
            None
        }
    }

    /// Deserialize the whole input into `A`, for argument types that need no
    /// form tolerance.
    pub fn deserialize<A: DeserializeOwned>(&self) -> Result<A, ValidationErrors> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|e| {
            ValidationErrors::single(GENERAL_FIELD, "invalid", e.to_string())
        })
    }

    /// Return `value` if no issue was recorded, otherwise every issue.
    ///
    /// `value` is `None` exactly when a required accessor failed, so callers
    /// can build it with `Option` combinators.
    pub fn finish<T>(&self, value: Option<T>) -> Result<T, ValidationErrors> {
        let issues = self.issues.take();
        if !issues.is_empty() {
            return Err(ValidationErrors { issues });
        }
        value.ok_or_else(|| {
            ValidationErrors::single(GENERAL_FIELD, "invalid", "arguments are incomplete")
        })
    }

    /// The input as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}
