//! Request validation
//!
//! Field checks applied before anything touches the store.

use std::fmt;

use serde::Serialize;

/// One rejected field and the reason it was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub field: String,
    pub description: String,
}

/// Every violation found in a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
pub struct ValidationError {
    pub violations: Vec<FieldViolation>,
}

impl ValidationError {
    pub fn single(field: &str, description: impl Into<String>) -> Self {
        Self {
            violations: vec![FieldViolation {
                field: field.to_string(),
                description: description.into(),
            }],
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .violations
            .iter()
            .map(|v| format!("{}: {}", v.field, v.description))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

/// Collects violations across several fields
#[derive(Debug, Default)]
pub struct Violations(Vec<FieldViolation>);

impl Violations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a single field check
    pub fn check(&mut self, field: &str, result: Result<(), String>) -> &mut Self {
        if let Err(description) = result {
            self.0.push(FieldViolation {
                field: field.to_string(),
                description,
            });
        }
        self
    }

    pub fn finish(&mut self) -> Result<(), ValidationError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                violations: std::mem::take(&mut self.0),
            })
        }
    }
}

pub fn validate_length(value: &str, min: usize, max: usize) -> Result<(), String> {
    let n = value.chars().count();
    if n < min || n > max {
        return Err(format!("must contain from {}-{} characters", min, max));
    }
    Ok(())
}

pub fn validate_username(value: &str) -> Result<(), String> {
    validate_length(value, 3, 100)?;
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err("must contain only lowercase letters, digits, or underscore".to_string());
    }
    Ok(())
}

pub fn validate_password(value: &str) -> Result<(), String> {
    validate_length(value, 6, 100)
}

pub fn validate_full_name(value: &str) -> Result<(), String> {
    validate_length(value, 3, 100)?;
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
    {
        return Err("must contain only letters, digits or spaces".to_string());
    }
    Ok(())
}

pub fn validate_email(value: &str) -> Result<(), String> {
    validate_length(value, 6, 200)?;
    if value.parse::<lettre::Address>().is_err() {
        return Err("is not a valid email address".to_string());
    }
    Ok(())
}

pub fn validate_id(value: i64) -> Result<(), String> {
    if value <= 0 {
        return Err("must be a positive integer".to_string());
    }
    Ok(())
}

pub fn validate_secret_code(value: &str) -> Result<(), String> {
    validate_length(value, 32, 128)
}

pub fn validate_currency(value: &str) -> Result<(), String> {
    if value.len() != 3 || !value.chars().all(|c| c.is_ascii_uppercase()) {
        return Err("must be a three-letter upper-case currency code".to_string());
    }
    Ok(())
}
