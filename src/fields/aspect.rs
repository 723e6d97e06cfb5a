// ============================================================================
// Aspect keys
// ============================================================================
//
// Every per-system piece of a Field (name, value, calculator, validator,
// converter) lives in an AspectTable keyed by (system, direction). Lookups
// walk a fixed fallback chain: system+direction, then system, then bare.
//
// ============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::SyncError;

/// The systems a field value can be represented in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum System {
    /// The cache store itself.
    Ass,
    /// ERP / property database.
    Acu,
    /// CRM.
    Sf,
    /// Hotel operations system.
    Sh,
}

impl System {
    pub const ALL: [System; 4] = [System::Ass, System::Acu, System::Sf, System::Sh];

    /// Short id used in delimited strings and logs.
    pub fn id(&self) -> &'static str {
        match self {
            System::Ass => "As",
            System::Acu => "Ac",
            System::Sf => "Sf",
            System::Sh => "Sh",
        }
    }
}

impl fmt::Display for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for System {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "As" | "Ass" => Ok(System::Ass),
            "Ac" | "Acu" => Ok(System::Acu),
            "Sf" => Ok(System::Sf),
            "Sh" => Ok(System::Sh),
            other => Err(SyncError::Validation(format!("unknown system id '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    /// Reading from a system.
    From,
    /// Writing onto a system.
    Onto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Insert,
    Update,
    Delete,
    Search,
}

/// Explicit accessor context passed to every contextual Field operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SyncContext {
    pub system: Option<System>,
    pub direction: Option<Direction>,
    pub action: Option<Action>,
}

impl SyncContext {
    /// The canonical (system-less) context.
    pub fn canonical() -> Self {
        Self::default()
    }

    pub fn system(system: System) -> Self {
        Self { system: Some(system), ..Self::default() }
    }

    pub fn from(system: System) -> Self {
        Self { system: Some(system), direction: Some(Direction::From), action: None }
    }

    pub fn onto(system: System) -> Self {
        Self { system: Some(system), direction: Some(Direction::Onto), action: None }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn key(&self) -> AspectKey {
        AspectKey::new(self.system, self.direction)
    }
}

/// Key of one aspect entry. A direction is only meaningful together with a system,
/// so a direction without a system is dropped on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AspectKey {
    system: Option<System>,
    direction: Option<Direction>,
}

impl AspectKey {
    pub const BARE: AspectKey = AspectKey { system: None, direction: None };

    pub fn new(system: Option<System>, direction: Option<Direction>) -> Self {
        Self { system, direction: system.and(direction) }
    }

    pub fn system(&self) -> Option<System> {
        self.system
    }

    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    /// Keys to try for this key, most specific first.
    pub fn fallback_chain(&self) -> impl Iterator<Item = AspectKey> {
        let mut chain = [None, None, Some(AspectKey::BARE)];
        if let Some(system) = self.system {
            if self.direction.is_some() {
                chain[0] = Some(*self);
            }
            chain[1] = Some(AspectKey { system: Some(system), direction: None });
        }
        chain.into_iter().flatten()
    }

    /// Fallback chain that stops before the bare key.
    pub fn system_chain(&self) -> impl Iterator<Item = AspectKey> {
        let system = self.system;
        self.fallback_chain().filter(move |key| system.is_none() || key.system.is_some())
    }
}

/// Small ordered table of aspect entries.
#[derive(Clone)]
pub struct AspectTable<T> {
    entries: Vec<(AspectKey, T)>,
}

impl<T> Default for AspectTable<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T> AspectTable<T> {
    pub fn insert(&mut self, key: AspectKey, value: T) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: AspectKey) -> Option<T> {
        let idx = self.entries.iter().position(|(k, _)| *k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn exact(&self, key: AspectKey) -> Option<&T> {
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn exact_mut(&mut self, key: AspectKey) -> Option<&mut T> {
        self.entries.iter_mut().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Most specific entry along the key's fallback chain.
    pub fn lookup(&self, key: AspectKey) -> Option<&T> {
        key.fallback_chain().find_map(|k| self.exact(k))
    }

    /// Like [`lookup`](Self::lookup) but never falls back to the bare entry when the key
    /// names a system.
    pub fn lookup_system(&self, key: AspectKey) -> Option<&T> {
        key.system_chain().find_map(|k| self.exact(k))
    }

    pub fn keys(&self) -> impl Iterator<Item = AspectKey> + '_ {
        self.entries.iter().map(|(k, _)| *k)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: fmt::Debug> fmt::Debug for AspectTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter().map(|(k, v)| (k, v))).finish()
    }
}
