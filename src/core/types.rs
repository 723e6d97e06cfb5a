use std::collections::BTreeMap;
use std::fmt;

use super::{Result, SyncError, Value};

pub type Row = Vec<Value>;

/// Column name to value map used for every store write and read.
pub type ColumnValues = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Integer,
    Float,
    Text,
    Boolean,
    Date,
    Timestamp,
}

impl DataType {
    pub fn is_compatible(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (DataType::Integer, Value::Integer(_))
                | (DataType::Float, Value::Float(_) | Value::Integer(_))
                | (DataType::Text, Value::Text(_))
                | (DataType::Boolean, Value::Boolean(_))
                | (DataType::Date, Value::Date(_))
                | (DataType::Timestamp, Value::Timestamp(_))
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Integer => "INTEGER",
            DataType::Float => "FLOAT",
            DataType::Text => "TEXT",
            DataType::Boolean => "BOOLEAN",
            DataType::Date => "DATE",
            DataType::Timestamp => "TIMESTAMP",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub primary_key: bool,
    /// External identifier column; part of the default upsert match.
    pub identifier: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            primary_key: false,
            identifier: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn identifier(mut self) -> Self {
        self.identifier = true;
        self
    }

    pub fn validate(&self, value: &Value) -> Result<()> {
        if value.is_null() {
            if !self.nullable && !self.primary_key {
                return Err(SyncError::Validation(format!(
                    "Column '{}' cannot be NULL",
                    self.name
                )));
            }
            return Ok(());
        }

        if !self.data_type.is_compatible(value) {
            return Err(SyncError::Validation(format!(
                "Column '{}' expects type {}, got {}",
                self.name,
                self.data_type,
                value.type_name()
            )));
        }

        Ok(())
    }
}

/// Table definition: name plus ordered columns. The primary key column, if any, is a
/// serial integer assigned by the store on insert.
#[derive(Debug, Clone)]
pub struct Schema {
    name: String,
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self { name: name.into(), columns }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn find_column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|col| col.name == name)
    }

    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.find_column_index(name).map(|idx| &self.columns[idx])
    }

    pub fn primary_key(&self) -> Option<&Column> {
        self.columns.iter().find(|col| col.primary_key)
    }

    pub fn identifier_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|col| col.identifier)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Checks that every key of `values` names a column of this table.
    pub fn check_columns(&self, values: &ColumnValues) -> Result<()> {
        for name in values.keys() {
            if self.find_column_index(name).is_none() {
                return Err(SyncError::Persistence(format!(
                    "Column '{}' not found in table '{}'",
                    name, self.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(
            "clients",
            vec![
                Column::new("cl_pk", DataType::Integer).primary_key(),
                Column::new("cl_ac_id", DataType::Text).identifier(),
                Column::new("cl_name", DataType::Text).not_null(),
            ],
        )
    }

    #[test]
    fn test_identifier_columns() {
        let names: Vec<_> = schema().identifier_columns().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec!["cl_ac_id"]);
    }

    #[test]
    fn test_validate_type_and_null() {
        let s = schema();
        assert!(s.get_column("cl_ac_id").unwrap().validate(&Value::Integer(3)).is_err());
        assert!(s.get_column("cl_name").unwrap().validate(&Value::Null).is_err());
        assert!(s.get_column("cl_pk").unwrap().validate(&Value::Null).is_ok());
    }

    #[test]
    fn test_unknown_column_rejected() {
        let mut values = ColumnValues::new();
        values.insert("cl_nope".into(), Value::Null);
        assert!(schema().check_columns(&values).is_err());
    }
}
