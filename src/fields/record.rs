use std::collections::BTreeMap;

use crate::core::{ColumnValues, Result, SyncError, Value};
use crate::fields::aspect::{SyncContext, System};
use crate::fields::field::{Field, FieldValue};
use crate::fields::path::FieldPath;

pub type Records = Vec<Record>;

/// Ordered, name-unique collection of fields. List-valued fields nest further records
/// (the rooming list of a reservation), addressed by [`FieldPath`]s.
#[derive(Debug, Clone, Default)]
pub struct Record {
    fields: Vec<Field>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `field`, replacing a field of the same name.
    pub fn with(mut self, field: Field) -> Self {
        match self.fields.iter_mut().find(|f| f.name() == field.name()) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
        self
    }

    pub fn add_field(&mut self, field: Field) -> Result<()> {
        if self.contains(field.name()) {
            return Err(SyncError::Validation(format!(
                "record already has a field named '{}'",
                field.name()
            )));
        }
        self.fields.push(field);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name() == name)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name() == name)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.fields.iter_mut().find(|f| f.name() == name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.fields.iter().map(Field::name).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Canonical value of a top-level field; NULL when missing.
    pub fn val(&self, name: &str) -> Value {
        self.field(name).map(Field::val).unwrap_or(Value::Null)
    }

    pub fn set_val(&mut self, name: &str, value: impl Into<Value>) -> bool {
        match self.field_mut(name) {
            Some(field) => field.set_val(value),
            None => false,
        }
    }

    pub fn get(&self, name: &str, ctx: SyncContext) -> Option<FieldValue> {
        self.field(name)?.get(ctx)
    }

    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>, ctx: SyncContext) -> bool {
        match self.field_mut(name) {
            Some(field) => field.set(value, ctx),
            None => false,
        }
    }

    /// Top-level field named `name` in `system`.
    pub fn field_by_system_name(&mut self, system: System, name: &str) -> Option<&mut Field> {
        self.fields.iter_mut().find(|f| f.name_in(system) == Some(name))
    }

    pub fn rooming(&self, name: &str) -> &[Record] {
        self.field(name).and_then(Field::records).map(Vec::as_slice).unwrap_or(&[])
    }

    // ========================================================================
    // Paths
    // ========================================================================

    pub fn field_at(&self, path: &FieldPath) -> Option<&Field> {
        let (last, parents) = path.segments().split_last()?;
        let mut rec = self;
        for seg in parents {
            rec = rec.field(&seg.name)?.records()?.get(seg.index?)?;
        }
        rec.field(&last.name)
    }

    pub fn field_at_mut(&mut self, path: &FieldPath) -> Option<&mut Field> {
        let (last, parents) = path.segments().split_last()?;
        let mut rec = self;
        for seg in parents {
            rec = rec.field_mut(&seg.name)?.records_mut()?.get_mut(seg.index?)?;
        }
        rec.field_mut(&last.name)
    }

    pub fn val_at(&self, path: &FieldPath) -> Value {
        self.field_at(path).map(Field::val).unwrap_or(Value::Null)
    }

    /// Every scalar field, with list positions propagated into the path.
    pub fn leaves(&self) -> Vec<(FieldPath, &Field)> {
        let mut out = Vec::new();
        self.collect_leaves(&FieldPath::root(), &mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, prefix: &FieldPath, out: &mut Vec<(FieldPath, &'a Field)>) {
        for field in &self.fields {
            let path = prefix.child(field.name());
            match field.records() {
                Some(recs) => {
                    for (idx, rec) in recs.iter().enumerate() {
                        rec.collect_leaves(&path.indexed(idx), out);
                    }
                }
                None => out.push((path, field)),
            }
        }
    }

    // ========================================================================
    // Copy / merge
    // ========================================================================

    /// Clone keeping only the scalar fields accepted by `filter`. List fields are kept
    /// with their positions so that nested paths stay stable.
    pub fn copy<F>(&self, filter: F) -> Record
    where
        F: Fn(&FieldPath, &Field) -> bool,
    {
        self.copy_filtered(&FieldPath::root(), &filter)
    }

    fn copy_filtered<F>(&self, prefix: &FieldPath, filter: &F) -> Record
    where
        F: Fn(&FieldPath, &Field) -> bool,
    {
        let mut out = Record::new();
        for field in &self.fields {
            let path = prefix.child(field.name());
            match field.records() {
                Some(recs) => {
                    let nested: Records = recs
                        .iter()
                        .enumerate()
                        .map(|(idx, rec)| rec.copy_filtered(&path.indexed(idx), filter))
                        .collect();
                    if nested.iter().any(|rec| !rec.is_empty()) || filter(&path, field) {
                        out.fields.push(field.cleared().with_list(nested));
                    }
                }
                None if filter(&path, field) => out.fields.push(field.clone()),
                None => {}
            }
        }
        out
    }

    /// Fields mapped to `system` only.
    pub fn project(&self, system: System) -> Record {
        self.copy(|_, field| field.maps_to(system))
    }

    /// Takes over every non-empty canonical scalar of `other` accepted by `filter`,
    /// growing list fields as needed. Returns the number of merged values.
    pub fn merge<F>(&mut self, other: &Record, filter: F) -> usize
    where
        F: Fn(&FieldPath, &Field) -> bool,
    {
        self.merge_filtered(other, &FieldPath::root(), &filter)
    }

    fn merge_filtered<F>(&mut self, other: &Record, prefix: &FieldPath, filter: &F) -> usize
    where
        F: Fn(&FieldPath, &Field) -> bool,
    {
        let mut merged = 0;
        for theirs in &other.fields {
            let path = prefix.child(theirs.name());
            if let Some(their_recs) = theirs.records() {
                if !self.field(theirs.name()).is_some_and(Field::is_list) {
                    self.fields.retain(|f| f.name() != theirs.name());
                    self.fields.push(theirs.cleared().with_list(Vec::new()));
                }
                if let Some(ours) = self.field_mut(theirs.name()).and_then(Field::records_mut) {
                    for (idx, their_rec) in their_recs.iter().enumerate() {
                        if idx >= ours.len() {
                            ours.push(their_rec.cleared());
                        }
                        merged += ours[idx].merge_filtered(their_rec, &path.indexed(idx), filter);
                    }
                }
                continue;
            }

            let value = theirs.val();
            if value.is_empty() || !filter(&path, theirs) {
                continue;
            }
            match self.field_mut(theirs.name()) {
                Some(ours) => {
                    if ours.set_val(value) {
                        merged += 1;
                    }
                }
                None => {
                    self.fields.push(theirs.clone());
                    merged += 1;
                }
            }
        }
        merged
    }

    /// Same structure with every stored value removed.
    pub fn cleared(&self) -> Record {
        Record {
            fields: self
                .fields
                .iter()
                .map(|f| match f.records() {
                    Some(recs) => f.cleared().with_list(recs.iter().map(Record::cleared).collect()),
                    None => f.cleared(),
                })
                .collect(),
        }
    }

    // ========================================================================
    // System transfer
    // ========================================================================

    /// Pulls every field from `system`; returns how many produced a canonical value.
    pub fn pull(&mut self, system: System) -> usize {
        self.fields.iter_mut().filter_map(|f| f.pull(system)).count()
    }

    /// Pushes every field onto `system`; returns how many produced a system value.
    pub fn push(&mut self, system: System) -> usize {
        self.fields.iter_mut().filter_map(|f| f.push(system)).count()
    }

    /// Stores system-side values keyed by the fields' names in `system` (e.g. a store row).
    /// Unmapped keys are ignored.
    pub fn set_system_values(&mut self, system: System, values: &ColumnValues) -> usize {
        let ctx = SyncContext::system(system);
        let mut count = 0;
        for (name, value) in values {
            if let Some(field) = self.field_by_system_name(system, name)
                && field.set(value.clone(), ctx)
            {
                count += 1;
            }
        }
        count
    }

    /// Flat map of the `system` representation, keyed by system names; nested entries use
    /// indexed paths such as `PERSON[0].NAME`.
    pub fn system_values(&self, system: System) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        self.collect_system_values(system, "", &mut out);
        out
    }

    fn collect_system_values(&self, system: System, prefix: &str, out: &mut BTreeMap<String, Value>) {
        let ctx = SyncContext::system(system);
        for field in &self.fields {
            let Some(name) = field.name_in(system) else { continue };
            let key = if prefix.is_empty() { name.to_string() } else { format!("{}.{}", prefix, name) };
            match field.records() {
                Some(recs) => {
                    for (idx, rec) in recs.iter().enumerate() {
                        rec.collect_system_values(system, &format!("{}[{}]", key, idx), out);
                    }
                }
                None => {
                    let value = field.get(ctx).map(FieldValue::into_value).unwrap_or(Value::Null);
                    out.insert(key, value);
                }
            }
        }
    }

    /// Top-level scalar system values as store columns, skipping empty ones.
    pub fn to_columns(&self, system: System) -> ColumnValues {
        let ctx = SyncContext::system(system);
        self.fields
            .iter()
            .filter(|f| !f.is_list())
            .filter_map(|f| {
                let name = f.name_in(system)?;
                let value = f.get(ctx)?.into_value().normalized();
                (!value.is_null()).then(|| (name.to_string(), value))
            })
            .collect()
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occupant(surname: &str) -> Record {
        Record::new()
            .with(Field::new("Surname").with_name(System::Sh, "NAME").with_value(surname))
            .with(Field::new("RoomNo").with_name(System::Sh, "RN"))
    }

    fn reservation() -> Record {
        Record::new()
            .with(Field::new("ResId").with_name(System::Sh, "RES-NR").with_value("4711"))
            .with(Field::new("ResNote"))
            .with(
                Field::new("ResPersons")
                    .with_name(System::Sh, "PERSON")
                    .with_list(vec![occupant("Smith"), occupant("Jones")]),
            )
    }

    #[test]
    fn test_add_field_rejects_duplicate_name() {
        let mut rec = reservation();
        assert!(rec.add_field(Field::new("ResId")).is_err());
        assert!(rec.add_field(Field::new("ResSubId")).is_ok());
    }

    #[test]
    fn test_paths_propagate_list_index() {
        let rec = reservation();
        let paths: Vec<String> = rec.leaves().iter().map(|(p, _)| p.to_string()).collect();
        assert!(paths.contains(&"ResPersons[1].Surname".to_string()));
        let path: FieldPath = "ResPersons[1].Surname".parse().unwrap();
        assert_eq!(rec.val_at(&path), Value::from("Jones"));
    }

    #[test]
    fn test_copy_with_filter() {
        let rec = reservation();
        let copied = rec.copy(|path, _| path.leaf_name() == Some("Surname"));
        assert!(!copied.contains("ResId"));
        assert_eq!(copied.rooming("ResPersons").len(), 2);
        assert!(copied.rooming("ResPersons")[0].field("RoomNo").is_none());
    }

    #[test]
    fn test_project_keeps_mapped_fields() {
        let projected = reservation().project(System::Sh);
        assert!(projected.contains("ResId"));
        assert!(!projected.contains("ResNote"));
    }

    #[test]
    fn test_merge_grows_rooming_list_and_skips_empty() {
        let mut ours = reservation();
        let mut theirs = reservation();
        theirs.set_val("ResId", "");
        if let Some(recs) = theirs.field_mut("ResPersons").and_then(Field::records_mut) {
            recs.push(occupant("Brown"));
        }
        let merged = ours.merge(&theirs, |_, _| true);
        assert_eq!(merged, 3);
        assert_eq!(ours.val("ResId"), Value::from("4711"));
        assert_eq!(ours.rooming("ResPersons").len(), 3);
        assert_eq!(ours.rooming("ResPersons")[2].val("Surname"), Value::from("Brown"));
    }

    #[test]
    fn test_system_values_use_system_names() {
        let mut rec = reservation();
        rec.push(System::Sh);
        let values = rec.system_values(System::Sh);
        assert_eq!(values.get("RES-NR"), Some(&Value::from("4711")));
        assert_eq!(values.get("PERSON[0].NAME"), Some(&Value::from("Smith")));
    }

    #[test]
    fn test_set_system_values_then_pull() {
        let mut rec = reservation().cleared();
        let mut row = ColumnValues::new();
        row.insert("RES-NR".into(), Value::from("99"));
        row.insert("UNKNOWN".into(), Value::from("x"));
        assert_eq!(rec.set_system_values(System::Sh, &row), 1);
        rec.pull(System::Sh);
        assert_eq!(rec.val("ResId"), Value::from("99"));
    }
}
