//! Config validation: identifier safety and relation consistency. Runs once per service.

use crate::config::{BelongsTo, ResolvedTable};
use crate::error::ConfigError;
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("static identifier regex"))
}

/// Identifiers are interpolated into SQL (quoted), so only plain names are accepted.
pub fn check_identifier(s: &str) -> Result<(), ConfigError> {
    if identifier_re().is_match(s) {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier(s.to_string()))
    }
}

fn check_belongs_to(b: &BelongsTo) -> Result<(), ConfigError> {
    check_identifier(&b.field)?;
    check_identifier(&b.foreign_key)?;
    check_identifier(&b.target_table)?;
    check_identifier(&b.target_key)?;
    if let Some(s) = &b.target_schema {
        check_identifier(s)?;
    }
    let mut seen = HashSet::new();
    for n in &b.nested {
        if !seen.insert(n.field.as_str()) {
            return Err(ConfigError::DuplicateField(n.field.clone()));
        }
        check_belongs_to(n)?;
    }
    Ok(())
}

pub fn validate(table: &ResolvedTable) -> Result<(), ConfigError> {
    check_identifier(&table.schema_name)?;
    check_identifier(&table.table_name)?;
    for c in &table.columns {
        check_identifier(&c.name)?;
    }

    let unknown = |column: &str| ConfigError::UnknownColumn {
        table: table.table_name.clone(),
        column: column.to_string(),
    };
    for f in &table.search_fields {
        if !table.has_column(f) {
            return Err(unknown(f));
        }
    }

    let mut fields: HashSet<&str> = HashSet::new();
    let claim = |field: &str| -> Result<(), ConfigError> {
        if field == "_count" {
            return Err(ConfigError::Invalid("'_count' is reserved for association counts".into()));
        }
        if table.has_column(field) {
            return Err(ConfigError::FieldCollision(field.to_string()));
        }
        Ok(())
    };

    for b in &table.belongs_to {
        check_belongs_to(b)?;
        if !table.has_column(&b.foreign_key) {
            return Err(unknown(&b.foreign_key));
        }
        claim(&b.field)?;
        if !fields.insert(b.field.as_str()) {
            return Err(ConfigError::DuplicateField(b.field.clone()));
        }
    }
    for j in &table.junctions {
        for id in [&j.field, &j.schema_name, &j.junction_table, &j.source_column, &j.target_column] {
            check_identifier(id)?;
        }
        if let Some(t) = &j.target {
            check_identifier(&t.schema_name)?;
            check_identifier(&t.table_name)?;
            check_identifier(&t.key_column)?;
        }
        claim(&j.field)?;
        if !fields.insert(j.field.as_str()) {
            return Err(ConfigError::DuplicateField(j.field.clone()));
        }
    }
    let mut counted = HashSet::new();
    for c in &table.countables {
        check_identifier(&c.field)?;
        check_identifier(&c.table)?;
        check_identifier(&c.foreign_key)?;
        if let Some(s) = &c.schema {
            check_identifier(s)?;
        }
        if !counted.insert(c.field.as_str()) {
            return Err(ConfigError::DuplicateField(c.field.clone()));
        }
    }
    Ok(())
}
