use std::cmp::Ordering;

use crate::core::{ColumnValues, Value};

/// Row filter evaluated against a row's column values.
///
/// Comparisons follow SQL NULL rules: `Eq` never matches a NULL, and `GreaterThanColumn`
/// is false when either side is NULL.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    All,
    Eq(String, Value),
    IsNull(String),
    NotNull(String),
    GreaterThanColumn(String, String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Predicate::Eq(column.to_string(), value.into())
    }

    /// Conjunction of column equalities; NULL values become `IS NULL` checks.
    pub fn matching(values: &ColumnValues) -> Self {
        Predicate::And(
            values
                .iter()
                .map(|(col, value)| match value.is_empty() {
                    true => Predicate::IsNull(col.clone()),
                    false => Predicate::Eq(col.clone(), value.clone()),
                })
                .collect(),
        )
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::All => other,
            Predicate::And(mut preds) => {
                preds.push(other);
                Predicate::And(preds)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    pub fn eval(&self, row: &ColumnValues) -> bool {
        let get = |col: &str| row.get(col).unwrap_or(&Value::Null);
        match self {
            Predicate::All => true,
            Predicate::Eq(col, value) => {
                let current = get(col);
                !current.is_null() && current == value
            }
            Predicate::IsNull(col) => get(col).is_empty(),
            Predicate::NotNull(col) => !get(col).is_empty(),
            Predicate::GreaterThanColumn(left, right) => {
                let (l, r) = (get(left), get(right));
                !l.is_null() && !r.is_null() && matches!(l.compare(r), Ok(Ordering::Greater))
            }
            Predicate::And(preds) => preds.iter().all(|p| p.eval(row)),
            Predicate::Or(preds) => preds.iter().any(|p| p.eval(row)),
            Predicate::Not(pred) => !pred.eval(row),
        }
    }

    /// Every column name the predicate refers to.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::All => {}
            Predicate::Eq(col, _) | Predicate::IsNull(col) | Predicate::NotNull(col) => out.push(col),
            Predicate::GreaterThanColumn(l, r) => {
                out.push(l);
                out.push(r);
            }
            Predicate::And(preds) | Predicate::Or(preds) => {
                preds.iter().for_each(|p| p.collect_columns(out))
            }
            Predicate::Not(pred) => pred.collect_columns(out),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// A single-table query.
#[derive(Debug, Clone)]
pub struct Select {
    pub table: String,
    pub filter: Predicate,
    pub order_by: Vec<(String, SortOrder)>,
    pub limit: Option<usize>,
}

impl Select {
    pub fn from(table: &str) -> Self {
        Self {
            table: table.to_string(),
            filter: Predicate::All,
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Predicate) -> Self {
        self.filter = filter;
        self
    }

    pub fn order_by(mut self, column: &str, order: SortOrder) -> Self {
        self.order_by.push((column.to_string(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sorts rows in place; NULLs sort last for ascending keys.
    pub fn sort(&self, rows: &mut [ColumnValues]) {
        if self.order_by.is_empty() {
            return;
        }
        rows.sort_by(|a, b| {
            for (col, order) in &self.order_by {
                let left = a.get(col).unwrap_or(&Value::Null);
                let right = b.get(col).unwrap_or(&Value::Null);
                let ord = left.compare(right).unwrap_or(Ordering::Equal);
                let ord = match order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }
}
