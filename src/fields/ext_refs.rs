use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::{Result, SyncError};

/// Separator between references in the delimited form.
pub const EXT_REFS_SEP: char = ',';
/// Separator between type and id of one reference.
pub const EXT_REF_TYPE_ID_SEP: char = '=';
/// Type assumed for entries that carry no explicit type.
pub const DEFAULT_EXT_REF_TYPE: &str = "RCI";

/// One third-party identifier, e.g. a loyalty membership number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExtRef {
    pub ref_type: String,
    pub id: String,
}

impl ExtRef {
    pub fn new(ref_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self { ref_type: ref_type.into().trim().to_uppercase(), id: id.into().trim().to_string() }
    }
}

impl fmt::Display for ExtRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.ref_type, EXT_REF_TYPE_ID_SEP, self.id)
    }
}

impl FromStr for ExtRef {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let (ref_type, id) = match s.split_once(EXT_REF_TYPE_ID_SEP) {
            Some((t, id)) => (t.trim(), id.trim()),
            None => (DEFAULT_EXT_REF_TYPE, s.trim()),
        };
        if ref_type.is_empty() || id.is_empty() {
            return Err(SyncError::Validation(format!("malformed external reference '{}'", s)));
        }
        Ok(ExtRef::new(ref_type, id))
    }
}

/// Deduplicated set of external references. The delimited string form is only used at
/// system boundaries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtRefs(BTreeSet<ExtRef>);

impl ExtRefs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `"RCI=123,KEYS=9"`. Blank entries are skipped; a malformed entry fails.
    pub fn parse(delimited: &str) -> Result<Self> {
        delimited
            .split(EXT_REFS_SEP)
            .filter(|part| !part.trim().is_empty())
            .map(str::parse::<ExtRef>)
            .collect::<Result<BTreeSet<_>>>()
            .map(ExtRefs)
    }

    /// Like [`ExtRefs::parse`], but drops malformed entries and keeps the valid ones.
    pub fn parse_valid(delimited: &str) -> Self {
        delimited
            .split(EXT_REFS_SEP)
            .filter(|part| !part.trim().is_empty())
            .filter_map(|part| match part.parse::<ExtRef>() {
                Ok(ext_ref) => Some(ext_ref),
                Err(e) => {
                    warn!(entry = part, error = %e, "external reference dropped");
                    None
                }
            })
            .collect()
    }

    pub fn to_delimited(&self) -> String {
        self.0.iter().map(ExtRef::to_string).collect::<Vec<_>>().join(&EXT_REFS_SEP.to_string())
    }

    pub fn insert(&mut self, ext_ref: ExtRef) -> bool {
        self.0.insert(ext_ref)
    }

    pub fn contains(&self, ext_ref: &ExtRef) -> bool {
        self.0.contains(ext_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExtRef> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn union(&self, other: &ExtRefs) -> ExtRefs {
        ExtRefs(self.0.union(&other.0).cloned().collect())
    }

    pub fn intersection(&self, other: &ExtRefs) -> ExtRefs {
        ExtRefs(self.0.intersection(&other.0).cloned().collect())
    }

    pub fn intersects(&self, other: &ExtRefs) -> bool {
        !self.0.is_disjoint(&other.0)
    }
}

impl FromIterator<ExtRef> for ExtRefs {
    fn from_iter<I: IntoIterator<Item = ExtRef>>(iter: I) -> Self {
        ExtRefs(iter.into_iter().collect())
    }
}

impl fmt::Display for ExtRefs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_delimited())
    }
}
