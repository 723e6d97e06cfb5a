use std::fmt;
use std::str::FromStr;

use crate::core::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathSegment {
    pub name: String,
    pub index: Option<usize>,
}

/// Address of a field inside a possibly nested record, e.g. `ResPersons[2].Surname`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath {
    segments: Vec<PathSegment>,
}

impl FieldPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Path of a field named `name` inside the record this path points into.
    pub fn child(&self, name: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(PathSegment { name: name.to_string(), index: None });
        Self { segments }
    }

    /// Sets the list index of the last segment.
    pub fn indexed(&self, index: usize) -> Self {
        let mut segments = self.segments.clone();
        if let Some(last) = segments.last_mut() {
            last.index = Some(index);
        }
        Self { segments }
    }

    pub fn leaf_name(&self) -> Option<&str> {
        self.segments.last().map(|seg| seg.name.as_str())
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(&seg.name)?;
            if let Some(idx) = seg.index {
                write!(f, "[{}]", idx)?;
            }
        }
        Ok(())
    }
}

impl FromStr for FieldPath {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut segments = Vec::new();
        for part in s.split('.') {
            let (name, index) = match part.find('[') {
                Some(open) => {
                    let close = part
                        .strip_suffix(']')
                        .ok_or_else(|| SyncError::Validation(format!("unclosed index in path '{}'", s)))?;
                    let idx = close[open + 1..]
                        .parse::<usize>()
                        .map_err(|e| SyncError::Validation(format!("bad index in path '{}': {}", s, e)))?;
                    (&part[..open], Some(idx))
                }
                None => (part, None),
            };
            if name.is_empty() {
                return Err(SyncError::Validation(format!("empty segment in path '{}'", s)));
            }
            segments.push(PathSegment { name: name.to_string(), index });
        }
        Ok(Self { segments })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let path: FieldPath = "ResPersons[2].Surname".parse().unwrap();
        assert_eq!(path.segments().len(), 2);
        assert_eq!(path.segments()[0].index, Some(2));
        assert_eq!(path.leaf_name(), Some("Surname"));
        assert_eq!(path.to_string(), "ResPersons[2].Surname");
    }

    #[test]
    fn test_child_and_indexed() {
        let path = FieldPath::root().child("ResPersons").indexed(0).child("Forename");
        assert_eq!(path.to_string(), "ResPersons[0].Forename");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("a[1".parse::<FieldPath>().is_err());
        assert!("a[x]".parse::<FieldPath>().is_err());
        assert!("a..b".parse::<FieldPath>().is_err());
    }
}
