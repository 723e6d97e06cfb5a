use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::core::{Result, Value};
use crate::fields::aspect::{AspectKey, AspectTable, SyncContext, System};
use crate::fields::record::Records;

pub type Calculator = Arc<dyn Fn(&Field) -> FieldValue + Send + Sync>;
pub type Validator = Arc<dyn Fn(&Field, &FieldValue) -> Result<()> + Send + Sync>;
pub type Converter = Arc<dyn Fn(&Field, FieldValue) -> Result<FieldValue> + Send + Sync>;

/// Value held by a field aspect: a scalar or a nested list of records.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Scalar(Value),
    List(Records),
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Scalar(v) => v.is_empty(),
            FieldValue::List(recs) => recs.is_empty(),
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            FieldValue::Scalar(v) => Some(v),
            FieldValue::List(_) => None,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            FieldValue::Scalar(v) => v,
            FieldValue::List(_) => Value::Null,
        }
    }

    pub fn as_records(&self) -> Option<&Records> {
        match self {
            FieldValue::List(recs) => Some(recs),
            FieldValue::Scalar(_) => None,
        }
    }
}

macro_rules! scalar_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for FieldValue {
            fn from(v: $ty) -> Self {
                FieldValue::Scalar(v.into())
            }
        })*
    };
}

scalar_from!(Value, &str, String, i64, bool, chrono::NaiveDate, chrono::NaiveDateTime);

/// One logical attribute with per-system representations.
///
/// Each aspect (system name, stored value, calculator, validator, converter) is looked up
/// along the [`AspectKey`] fallback chain, so a bare aspect acts as the default for every
/// system until a system overrides it.
#[derive(Clone)]
pub struct Field {
    name: String,
    names: AspectTable<String>,
    values: AspectTable<FieldValue>,
    calculators: AspectTable<Calculator>,
    validators: AspectTable<Validator>,
    converters: AspectTable<Converter>,
}

impl Field {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            names: AspectTable::default(),
            values: AspectTable::default(),
            calculators: AspectTable::default(),
            validators: AspectTable::default(),
            converters: AspectTable::default(),
        }
    }

    // ========================================================================
    // Builders
    // ========================================================================

    pub fn with_value(mut self, value: impl Into<FieldValue>) -> Self {
        self.values.insert(AspectKey::BARE, value.into());
        self
    }

    pub fn with_list(mut self, records: Records) -> Self {
        self.values.insert(AspectKey::BARE, FieldValue::List(records));
        self
    }

    /// Name of this field in `system` (e.g. a column or XML tag).
    pub fn with_name(mut self, system: System, name: impl Into<String>) -> Self {
        self.names.insert(SyncContext::system(system).key(), name.into());
        self
    }

    pub fn with_calculator<F>(mut self, ctx: SyncContext, calc: F) -> Self
    where
        F: Fn(&Field) -> FieldValue + Send + Sync + 'static,
    {
        self.calculators.insert(ctx.key(), Arc::new(calc));
        self
    }

    pub fn with_validator<F>(mut self, ctx: SyncContext, validator: F) -> Self
    where
        F: Fn(&Field, &FieldValue) -> Result<()> + Send + Sync + 'static,
    {
        self.validators.insert(ctx.key(), Arc::new(validator));
        self
    }

    pub fn with_converter<F>(mut self, ctx: SyncContext, converter: F) -> Self
    where
        F: Fn(&Field, FieldValue) -> Result<FieldValue> + Send + Sync + 'static,
    {
        self.converters.insert(ctx.key(), Arc::new(converter));
        self
    }

    // ========================================================================
    // Names
    // ========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn name_in(&self, system: System) -> Option<&str> {
        self.names
            .lookup_system(SyncContext::system(system).key())
            .map(String::as_str)
    }

    pub fn maps_to(&self, system: System) -> bool {
        self.name_in(system).is_some()
    }

    // ========================================================================
    // Contextual access
    // ========================================================================

    /// Raw value for `ctx` without validation: stored value or calculator result of the
    /// most specific key in the fallback chain.
    pub fn value(&self, ctx: SyncContext) -> Option<FieldValue> {
        self.resolve(ctx.key().fallback_chain())
    }

    fn system_value(&self, ctx: SyncContext) -> Option<FieldValue> {
        self.resolve(ctx.key().system_chain())
    }

    fn resolve(&self, chain: impl Iterator<Item = AspectKey>) -> Option<FieldValue> {
        for key in chain {
            if let Some(value) = self.values.exact(key) {
                return Some(value.clone());
            }
            if let Some(calc) = self.calculators.exact(key) {
                return Some(calc(self));
            }
        }
        None
    }

    fn validate(&self, ctx: SyncContext, value: &FieldValue) -> bool {
        match self.validators.lookup(ctx.key()) {
            Some(validator) => match validator(self, value) {
                Ok(()) => true,
                Err(e) => {
                    debug!(field = %self.name, ?ctx, error = %e, "value rejected by validator");
                    false
                }
            },
            None => true,
        }
    }

    fn convert(&self, ctx: SyncContext, value: FieldValue) -> Option<FieldValue> {
        match self.converters.lookup_system(ctx.key()) {
            Some(converter) => match converter(self, value) {
                Ok(converted) => Some(converted),
                Err(e) => {
                    debug!(field = %self.name, ?ctx, error = %e, "value conversion failed");
                    None
                }
            },
            None => Some(value),
        }
    }

    /// Validated value for `ctx`; a rejected value reads as absent.
    pub fn get(&self, ctx: SyncContext) -> Option<FieldValue> {
        let value = self.value(ctx)?;
        self.validate(ctx, &value).then_some(value)
    }

    /// Stores `value` under `ctx`. A rejected value is dropped and the aspect left empty.
    pub fn set(&mut self, value: impl Into<FieldValue>, ctx: SyncContext) -> bool {
        let value = value.into();
        let key = ctx.key();
        if !self.validate(ctx, &value) {
            self.values.remove(key);
            return false;
        }
        self.values.insert(key, value);
        true
    }

    pub fn clear(&mut self, ctx: SyncContext) {
        self.values.remove(ctx.key());
    }

    // ========================================================================
    // Canonical shortcuts
    // ========================================================================

    /// Canonical scalar value; NULL when absent or list-valued.
    pub fn val(&self) -> Value {
        self.value(SyncContext::canonical())
            .map(FieldValue::into_value)
            .unwrap_or(Value::Null)
    }

    pub fn set_val(&mut self, value: impl Into<Value>) -> bool {
        self.set(FieldValue::Scalar(value.into()), SyncContext::canonical())
    }

    pub fn records(&self) -> Option<&Records> {
        match self.values.exact(AspectKey::BARE) {
            Some(FieldValue::List(recs)) => Some(recs),
            _ => None,
        }
    }

    pub fn records_mut(&mut self) -> Option<&mut Records> {
        match self.values.exact_mut(AspectKey::BARE) {
            Some(FieldValue::List(recs)) => Some(recs),
            _ => None,
        }
    }

    pub fn is_list(&self) -> bool {
        self.records().is_some()
    }

    /// Clone without any stored values (calculators, validators and converters stay).
    pub fn cleared(&self) -> Field {
        let mut field = self.clone();
        field.values = AspectTable::default();
        field
    }

    // ========================================================================
    // System transfer
    // ========================================================================

    /// Reads the value stored for `system`, validates and converts it to canonical form and
    /// keeps it as the bare value. Absent when nothing is stored or validation fails.
    pub fn pull(&mut self, system: System) -> Option<FieldValue> {
        if let Some(recs) = self.records_mut() {
            for rec in recs.iter_mut() {
                rec.pull(system);
            }
            return self.records().cloned().map(FieldValue::List);
        }

        let ctx = SyncContext::from(system);
        let raw = self.system_value(ctx)?;
        if !self.validate(ctx, &raw) {
            return None;
        }
        let canonical = self.convert(ctx, raw)?;
        self.values.insert(AspectKey::BARE, canonical.clone());
        Some(canonical)
    }

    /// Converts the canonical value into the representation of `system`, validates it and
    /// stores it as that system's value.
    pub fn push(&mut self, system: System) -> Option<FieldValue> {
        if let Some(recs) = self.records_mut() {
            for rec in recs.iter_mut() {
                rec.push(system);
            }
            return self.records().cloned().map(FieldValue::List);
        }

        let ctx = SyncContext::onto(system);
        let canonical = self.value(SyncContext::canonical())?;
        let converted = self.convert(ctx, canonical)?;
        if !self.validate(ctx, &converted) {
            return None;
        }
        self.values.remove(SyncContext::from(system).key());
        self.values.remove(ctx.key());
        self.values.insert(SyncContext::system(system).key(), converted.clone());
        Some(converted)
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.value(SyncContext::canonical()) == other.value(SyncContext::canonical())
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("names", &self.names)
            .field("values", &self.values)
            .finish_non_exhaustive()
    }
}
