use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::{ColumnValues, Result, Row, Schema, SyncError, Value};
use crate::store::filter::Predicate;

/// Rows of one cache table. The primary key column, if the schema has one, is filled from a
/// per-table serial counter on insert.
#[derive(Debug, Clone)]
pub struct Table {
    schema: Arc<Schema>,
    rows: BTreeMap<usize, Row>,
    next_row_id: usize,
    next_serial: i64,
}

impl Table {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema: Arc::new(schema),
            rows: BTreeMap::new(),
            next_row_id: 0,
            next_serial: 1,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn build_row(&self, base: Option<&Row>, values: &ColumnValues) -> Result<Row> {
        self.schema.check_columns(values)?;
        let mut row = match base {
            Some(row) => row.clone(),
            None => vec![Value::Null; self.schema.column_count()],
        };
        for (idx, column) in self.schema.columns().iter().enumerate() {
            if let Some(value) = values.get(&column.name) {
                let value = value.clone().normalized();
                column.validate(&value)?;
                row[idx] = value;
            }
        }
        Ok(row)
    }

    fn check_not_null(&self, row: &Row) -> Result<()> {
        for (column, value) in self.schema.columns().iter().zip(row) {
            if !column.nullable && !column.primary_key && value.is_null() {
                return Err(SyncError::Persistence(format!(
                    "Column '{}' of table '{}' cannot be NULL",
                    column.name,
                    self.schema.name()
                )));
            }
        }
        Ok(())
    }

    /// Inserts a row and returns its row id and stored values.
    pub fn insert(&mut self, values: &ColumnValues) -> Result<(usize, Row)> {
        let mut row = self.build_row(None, values)?;
        if let Some(pk_idx) = self.schema.columns().iter().position(|c| c.primary_key) {
            match row[pk_idx].as_i64() {
                Some(explicit) => self.next_serial = self.next_serial.max(explicit + 1),
                None => {
                    row[pk_idx] = Value::Integer(self.next_serial);
                    self.next_serial += 1;
                }
            }
        }
        self.check_not_null(&row)?;

        let id = self.next_row_id;
        self.next_row_id += 1;
        self.rows.insert(id, row.clone());
        Ok((id, row))
    }

    /// Applies `values` to row `id`; returns the previous row.
    pub fn update(&mut self, id: usize, values: &ColumnValues) -> Result<Row> {
        let old = self
            .rows
            .get(&id)
            .cloned()
            .ok_or_else(|| SyncError::Persistence(format!("row {} not found in '{}'", id, self.schema.name())))?;
        let new_row = self.build_row(Some(&old), values)?;
        self.check_not_null(&new_row)?;
        self.rows.insert(id, new_row);
        Ok(old)
    }

    pub fn delete(&mut self, id: usize) -> Option<Row> {
        self.rows.remove(&id)
    }

    /// Puts back a row removed or changed by an undone change.
    pub fn restore(&mut self, id: usize, row: Row) {
        self.rows.insert(id, row);
    }

    pub fn to_values(&self, row: &Row) -> ColumnValues {
        self.schema
            .columns()
            .iter()
            .zip(row)
            .map(|(col, value)| (col.name.clone(), value.clone()))
            .collect()
    }

    /// Row ids and values of every row matching `filter`, in insertion order.
    pub fn scan(&self, filter: &Predicate) -> Vec<(usize, ColumnValues)> {
        self.rows
            .iter()
            .map(|(id, row)| (*id, self.to_values(row)))
            .filter(|(_, values)| filter.eval(values))
            .collect()
    }
}
