//! Payload validation hook and the rule-driven validator built from table config.

use crate::config::{ResolvedTable, ValidationRule};
use crate::error::{ConfigError, EngineError};
use crate::service::params::Record;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

/// Which write the payload is for. Updates carry partial payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Update,
    Upsert,
}

/// Runs before every create/update/upsert. May reject the payload or return a rewritten one.
#[async_trait]
pub trait PayloadValidator: Send + Sync {
    async fn validate(&self, op: WriteOp, table: &ResolvedTable, data: Record) -> Result<Record, EngineError>;
}

struct CompiledRule {
    rule: ValidationRule,
    pattern: Option<Regex>,
}

/// Per-column rules (required, length, pattern, allowed values, numeric range, format).
pub struct RuleValidator {
    rules: HashMap<String, CompiledRule>,
}

impl RuleValidator {
    /// Compiles patterns up front; a bad pattern is a config error.
    pub fn new(rules: &HashMap<String, ValidationRule>) -> Result<Self, ConfigError> {
        let mut compiled = HashMap::with_capacity(rules.len());
        for (col, rule) in rules {
            let pattern = match &rule.pattern {
                Some(p) => Some(
                    Regex::new(p).map_err(|e| ConfigError::Invalid(format!("pattern for {}: {}", col, e)))?,
                ),
                None => None,
            };
            compiled.insert(
                col.clone(),
                CompiledRule {
                    rule: rule.clone(),
                    pattern,
                },
            );
        }
        Ok(RuleValidator { rules: compiled })
    }

    /// Full payload: required fields must be present and non-null.
    pub fn check(&self, body: &Record) -> Result<(), EngineError> {
        for (col, c) in &self.rules {
            let val = body.get(col);
            if c.rule.required == Some(true) && val.map_or(true, Value::is_null) {
                return Err(EngineError::validation(col, format!("{} is required", col)));
            }
            if let Some(v) = val {
                check_field(col, v, c)?;
            }
        }
        Ok(())
    }

    /// Partial payload: only the fields present are checked.
    pub fn check_partial(&self, body: &Record) -> Result<(), EngineError> {
        for (col, v) in body {
            if let Some(c) = self.rules.get(col) {
                if c.rule.required == Some(true) && v.is_null() {
                    return Err(EngineError::validation(col, format!("{} is required", col)));
                }
                check_field(col, v, c)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PayloadValidator for RuleValidator {
    async fn validate(&self, op: WriteOp, _table: &ResolvedTable, data: Record) -> Result<Record, EngineError> {
        match op {
            WriteOp::Create | WriteOp::Upsert => self.check(&data)?,
            WriteOp::Update => self.check_partial(&data)?,
        }
        Ok(data)
    }
}

fn check_field(col: &str, v: &Value, c: &CompiledRule) -> Result<(), EngineError> {
    if v.is_null() {
        return Ok(());
    }
    let rule = &c.rule;
    if let Some(format) = &rule.format {
        check_format(col, v, format)?;
    }
    if let Some(s) = v.as_str() {
        let len = s.chars().count();
        if let Some(max) = rule.max_length {
            if len > max as usize {
                return Err(EngineError::validation(col, format!("{} must be at most {} characters", col, max)));
            }
        }
        if let Some(min) = rule.min_length {
            if len < min as usize {
                return Err(EngineError::validation(col, format!("{} must be at least {} characters", col, min)));
            }
        }
        if let Some(re) = &c.pattern {
            if !re.is_match(s) {
                return Err(EngineError::validation(col, format!("{} does not match required pattern", col)));
            }
        }
    }
    if let Some(allowed) = &rule.allowed {
        if !allowed.iter().any(|a| value_eq(v, a)) {
            return Err(EngineError::validation(
                col,
                format!("{} must be one of: {:?}", col, allowed.iter().take(5).collect::<Vec<_>>()),
            ));
        }
    }
    if let Some(n) = v.as_f64() {
        if let Some(min) = rule.minimum {
            if n < min {
                return Err(EngineError::validation(col, format!("{} must be at least {}", col, min)));
            }
        }
        if let Some(max) = rule.maximum {
            if n > max {
                return Err(EngineError::validation(col, format!("{} must be at most {}", col, max)));
            }
        }
    }
    Ok(())
}

fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(n), Value::Number(m)) => n.as_f64() == m.as_f64(),
        _ => a == b,
    }
}

fn check_format(col: &str, v: &Value, format: &str) -> Result<(), EngineError> {
    let Some(s) = v.as_str() else { return Ok(()) };
    match format.to_lowercase().as_str() {
        "email" if !s.contains('@') || s.len() < 3 => {
            Err(EngineError::validation(col, format!("{} must be a valid email", col)))
        }
        "uuid" if uuid::Uuid::parse_str(s).is_err() => {
            Err(EngineError::validation(col, format!("{} must be a valid UUID", col)))
        }
        _ => Ok(()),
    }
}
