use tracing::debug;

use crate::core::{ColumnValues, Result, SyncError, Value};
use crate::store::{Predicate, Select, StoreConnection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub action: UpsertAction,
    pub affected: usize,
    /// Value of the requested returning column.
    pub key: Option<Value>,
}

/// Match-then-insert-or-update write of one logical row.
///
/// The match defaults to every non-empty identifier column of the table found in the
/// column values. Locked columns keep a non-empty stored value; the incoming value for
/// such a column is only written when the stored one is empty.
#[derive(Debug, Clone)]
pub struct Upsert {
    table: String,
    column_values: ColumnValues,
    match_values: Option<ColumnValues>,
    locked_columns: Vec<String>,
    returning: Option<String>,
    multiple_rows: bool,
}

impl Upsert {
    pub fn new(table: &str, column_values: ColumnValues) -> Self {
        Self {
            table: table.to_string(),
            column_values,
            match_values: None,
            locked_columns: Vec::new(),
            returning: None,
            multiple_rows: false,
        }
    }

    pub fn matching(mut self, match_values: ColumnValues) -> Self {
        self.match_values = Some(match_values);
        self
    }

    pub fn locked<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locked_columns.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn returning(mut self, column: &str) -> Self {
        self.returning = Some(column.to_string());
        self
    }

    /// Allows the match to hit more than one row.
    pub fn multiple_rows(mut self) -> Self {
        self.multiple_rows = true;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn resolve_match(&self, conn: &dyn StoreConnection) -> Result<ColumnValues> {
        let match_values: ColumnValues = match &self.match_values {
            Some(values) => values.iter().map(|(k, v)| (k.clone(), v.clone().normalized())).collect(),
            None => {
                let schema = conn.schema(&self.table)?;
                schema
                    .identifier_columns()
                    .filter_map(|col| {
                        let value = self.column_values.get(&col.name)?;
                        (!value.is_empty()).then(|| (col.name.clone(), value.clone()))
                    })
                    .collect()
            }
        };
        if match_values.is_empty() || match_values.values().all(Value::is_empty) {
            return Err(SyncError::Validation(format!(
                "upsert into '{}' without any non-empty match value",
                self.table
            )));
        }
        Ok(match_values)
    }

    pub async fn execute(&self, conn: &mut dyn StoreConnection) -> Result<UpsertOutcome> {
        let match_values = self.resolve_match(conn)?;
        let values: ColumnValues = self
            .column_values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().normalized()))
            .collect();
        let filter = Predicate::matching(&match_values);
        let existing = conn.select(&Select::from(&self.table).filter(filter)).await?;

        match existing.len() {
            0 => {
                let mut row = match_values;
                row.extend(values);
                let stored = conn.insert(&self.table, &row).await?;
                let key = self.returning.as_ref().and_then(|col| stored.get(col).cloned());
                debug!(table = %self.table, ?key, "upsert inserted row");
                Ok(UpsertOutcome { action: UpsertAction::Inserted, affected: 1, key })
            }
            n if n == 1 || self.multiple_rows => {
                let schema = conn.schema(&self.table)?;
                let pk = schema.primary_key().map(|c| c.name.clone());
                let mut affected = 0;
                let mut key = None;
                for current in &existing {
                    let write: ColumnValues = values
                        .iter()
                        .filter(|(col, _)| {
                            !self.locked_columns.contains(*col)
                                || current.get(*col).is_none_or(Value::is_empty)
                        })
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    let row_filter = match pk.as_ref().and_then(|pk| Some((pk, current.get(pk)?))) {
                        Some((pk, pk_value)) => Predicate::eq(pk, pk_value.clone()),
                        None => Predicate::matching(current),
                    };
                    let updated = if write.is_empty() {
                        1
                    } else {
                        conn.update(&self.table, &row_filter, &write).await?
                    };
                    if updated != 1 {
                        return Err(SyncError::Persistence(format!(
                            "upsert into '{}': expected 1 updated row but got {}",
                            self.table, updated
                        )));
                    }
                    affected += updated;
                    if key.is_none() {
                        key = self
                            .returning
                            .as_ref()
                            .and_then(|col| write.get(col).or_else(|| current.get(col)).cloned());
                    }
                }
                debug!(table = %self.table, affected, ?key, "upsert updated rows");
                Ok(UpsertOutcome { action: UpsertAction::Updated, affected, key })
            }
            n => Err(SyncError::Persistence(format!(
                "upsert into '{}': match {:?} hit {} rows; expected 1",
                self.table, match_values, n
            ))),
        }
    }
}

/// Single-call form of [`Upsert`]: returns the value of `returning_key`, if requested.
pub async fn upsert(
    conn: &mut dyn StoreConnection,
    table: &str,
    column_values: ColumnValues,
    match_values: Option<ColumnValues>,
    locked_columns: &[&str],
    returning_key: Option<&str>,
) -> Result<Option<Value>> {
    let mut request = Upsert::new(table, column_values).locked(locked_columns.iter().copied());
    if let Some(match_values) = match_values {
        request = request.matching(match_values);
    }
    if let Some(col) = returning_key {
        request = request.returning(col);
    }
    Ok(request.execute(conn).await?.key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, DataType, Schema};
    use crate::store::{CacheStore, MemoryStore};

    fn store() -> MemoryStore {
        MemoryStore::new(vec![Schema::new(
            "clients",
            vec![
                Column::new("cl_pk", DataType::Integer).primary_key(),
                Column::new("cl_ac_id", DataType::Text).identifier(),
                Column::new("cl_sf_id", DataType::Text).identifier(),
                Column::new("cl_name", DataType::Text),
                Column::new("cl_room", DataType::Text),
            ],
        )])
        .unwrap()
    }

    fn cols(pairs: &[(&str, &str)]) -> ColumnValues {
        pairs.iter().map(|(k, v)| (k.to_string(), Value::from(*v))).collect()
    }

    #[tokio::test]
    async fn test_empty_match_is_rejected() {
        let store = store();
        let mut conn = store.connect().await.unwrap();
        let err = upsert(conn.as_mut(), "clients", cols(&[("cl_name", "A")]), None, &[], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::Validation);

        let err = upsert(conn.as_mut(), "clients", cols(&[("cl_name", "A")]), Some(cols(&[("cl_ac_id", "")])), &[], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::Validation);
        assert_eq!(store.row_count("clients").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = store();
        let mut conn = store.connect().await.unwrap();
        let values = cols(&[("cl_ac_id", "E1"), ("cl_name", "Smith")]);
        let first = upsert(conn.as_mut(), "clients", values.clone(), None, &[], Some("cl_pk")).await.unwrap();
        let second = upsert(conn.as_mut(), "clients", values, None, &[], Some("cl_pk")).await.unwrap();
        assert_eq!(first, Some(Value::Integer(1)));
        assert_eq!(first, second);
        assert_eq!(store.row_count("clients").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_locked_column_keeps_non_empty_value() {
        let store = store();
        let mut conn = store.connect().await.unwrap();
        let key = cols(&[("cl_ac_id", "E1")]);
        upsert(conn.as_mut(), "clients", cols(&[("cl_room", "A")]), Some(key.clone()), &[], None).await.unwrap();
        upsert(conn.as_mut(), "clients", cols(&[("cl_room", "B"), ("cl_name", "N")]), Some(key.clone()), &["cl_room"], None)
            .await
            .unwrap();

        let rows = conn.select(&Select::from("clients")).await.unwrap();
        assert_eq!(rows[0].get("cl_room"), Some(&Value::from("A")));
        assert_eq!(rows[0].get("cl_name"), Some(&Value::from("N")));
    }

    #[tokio::test]
    async fn test_locked_column_fills_empty_value() {
        let store = store();
        let mut conn = store.connect().await.unwrap();
        let key = cols(&[("cl_ac_id", "E1")]);
        upsert(conn.as_mut(), "clients", cols(&[("cl_name", "N")]), Some(key.clone()), &[], None).await.unwrap();
        upsert(conn.as_mut(), "clients", cols(&[("cl_room", "B")]), Some(key), &["cl_room"], None).await.unwrap();
        let rows = conn.select(&Select::from("clients")).await.unwrap();
        assert_eq!(rows[0].get("cl_room"), Some(&Value::from("B")));
    }

    #[tokio::test]
    async fn test_multiple_matches_fail_unless_allowed() {
        let store = store();
        let mut conn = store.connect().await.unwrap();
        conn.insert("clients", &cols(&[("cl_name", "Twin"), ("cl_ac_id", "E1")])).await.unwrap();
        conn.insert("clients", &cols(&[("cl_name", "Twin"), ("cl_ac_id", "E2")])).await.unwrap();

        let request = Upsert::new("clients", cols(&[("cl_room", "9")])).matching(cols(&[("cl_name", "Twin")]));
        let err = request.execute(conn.as_mut()).await.unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::Persistence);

        let outcome = request.multiple_rows().execute(conn.as_mut()).await.unwrap();
        assert_eq!(outcome.action, UpsertAction::Updated);
        assert_eq!(outcome.affected, 2);
    }
}
