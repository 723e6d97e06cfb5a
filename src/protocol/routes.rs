use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use serde::Deserialize;
use tracing::{info, warn};

use crate::core::{Result, SyncError};
use crate::protocol::parse::RequestShape;

/// One slot of a route: the request is parsed into `shape` and passed to `handlers` in order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteSlot {
    pub shape: RequestShape,
    pub handlers: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RouteFile {
    #[serde(default)]
    ignored: Vec<String>,
    #[serde(default)]
    routes: BTreeMap<String, Vec<RouteSlot>>,
}

/// Outcome of looking up an operation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'t> {
    Chain(&'t [RouteSlot]),
    Ignored,
    Unknown,
}

/// Operation code routing, loaded from a TOML file:
///
/// ```toml
/// ignored = ["TS"]
///
/// [[routes.GUEST-CREATE]]
/// shape = "guest"
/// handlers = ["guest_upsert"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    routes: BTreeMap<String, Vec<RouteSlot>>,
    ignored: BTreeSet<String>,
}

impl RouteTable {
    pub fn parse(text: &str) -> Result<Self> {
        let file: RouteFile =
            toml::from_str(text).map_err(|e| SyncError::Config(format!("invalid route table: {}", e)))?;
        for (oc, slots) in &file.routes {
            if slots.is_empty() {
                return Err(SyncError::Config(format!("route {} has no slots", oc)));
            }
            if let Some(slot) = slots.iter().find(|slot| slot.handlers.is_empty()) {
                return Err(SyncError::Config(format!("route {} slot {} has no handlers", oc, slot.shape)));
            }
            if file.ignored.contains(oc) {
                return Err(SyncError::Config(format!("operation code {} is both routed and ignored", oc)));
            }
        }
        Ok(Self { routes: file.routes, ignored: file.ignored.into_iter().collect() })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("cannot read route table {}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    pub fn route(&self, oc: &str) -> Route<'_> {
        match self.routes.get(oc) {
            Some(slots) => Route::Chain(slots),
            None if self.ignored.contains(oc) => Route::Ignored,
            None => Route::Unknown,
        }
    }

    /// Every handler name referenced by any route.
    pub fn handler_names(&self) -> BTreeSet<&str> {
        self.routes.values().flatten().flat_map(|slot| slot.handlers.iter().map(String::as_str)).collect()
    }

    /// Fails on the first handler name `known` rejects.
    pub fn check_handlers(&self, known: impl Fn(&str) -> bool) -> Result<()> {
        match self.handler_names().into_iter().find(|name| !known(name)) {
            Some(name) => Err(SyncError::Config(format!("route table names unknown handler '{}'", name))),
            None => Ok(()),
        }
    }

    pub fn operation_codes(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn ignored(&self) -> impl Iterator<Item = &str> {
        self.ignored.iter().map(String::as_str)
    }
}

struct Loaded {
    table: Arc<RouteTable>,
    modified: Option<SystemTime>,
}

/// Route table that is reloaded whenever its file's modification time changes.
///
/// A failed reload leaves the recorded mtime untouched, so the next lookup retries it.
pub struct ReloadableRoutes {
    path: PathBuf,
    loaded: RwLock<Option<Loaded>>,
}

impl ReloadableRoutes {
    /// Nothing is read until the first [`current`](Self::current) call.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), loaded: RwLock::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The table to route the next request with, reloading it first if the file changed.
    /// `known` validates handler names of a freshly loaded table.
    pub async fn current(&self, known: impl Fn(&str) -> bool) -> Result<Arc<RouteTable>> {
        let modified = tokio::fs::metadata(&self.path)
            .await
            .and_then(|meta| meta.modified())
            .map_err(|e| SyncError::Config(format!("cannot stat route table {}: {}", self.path.display(), e)))?;

        if let Some(loaded) = self.loaded.read()?.as_ref()
            && loaded.modified == Some(modified)
        {
            return Ok(Arc::clone(&loaded.table));
        }

        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SyncError::Config(format!("cannot read route table {}: {}", self.path.display(), e)))?;
        let table = match RouteTable::parse(&text).and_then(|t| t.check_handlers(&known).map(|_| t)) {
            Ok(table) => Arc::new(table),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "route table reload failed");
                return Err(e);
            }
        };

        let mut loaded = self.loaded.write()?;
        let reloaded = loaded.is_some();
        *loaded = Some(Loaded { table: Arc::clone(&table), modified: Some(modified) });
        info!(
            path = %self.path.display(),
            routes = table.routes.len(),
            ignored = table.ignored.len(),
            reloaded,
            "route table loaded"
        );
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTES: &str = r#"
ignored = ["TS", "CR"]

[[routes.GUEST-CREATE]]
shape = "guest"
handlers = ["guest_upsert"]

[[routes.RM]]
shape = "room_change"
handlers = ["room_change"]

[[routes.RM]]
shape = "basic"
handlers = ["keep_alive"]
"#;

    #[test]
    fn test_route_lookup() {
        let table = RouteTable::parse(ROUTES).unwrap();
        match table.route("RM") {
            Route::Chain(slots) => {
                assert_eq!(slots.len(), 2);
                assert_eq!(slots[0].shape, RequestShape::RoomChange);
            }
            other => panic!("unexpected route {:?}", other),
        }
        assert_eq!(table.route("TS"), Route::Ignored);
        assert_eq!(table.route("XX"), Route::Unknown);
        assert_eq!(table.handler_names().into_iter().collect::<Vec<_>>(), vec!["guest_upsert", "keep_alive", "room_change"]);
    }

    #[test]
    fn test_invalid_tables_are_rejected() {
        assert!(RouteTable::parse("[[routes.LA]]\nshape = \"basic\"\nhandlers = []\n").is_err());
        assert!(RouteTable::parse("[[routes.LA]]\nshape = \"nonsense\"\nhandlers = [\"x\"]\n").is_err());
        assert!(RouteTable::parse("ignored = [\"LA\"]\n[[routes.LA]]\nshape = \"basic\"\nhandlers = [\"x\"]\n").is_err());
        let err = RouteTable::parse(ROUTES).unwrap().check_handlers(|name| name != "room_change").unwrap_err();
        assert!(err.to_string().contains("room_change"));
    }

    #[tokio::test]
    async fn test_reload_on_change_and_retry_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.toml");
        std::fs::write(&path, ROUTES).unwrap();
        let routes = ReloadableRoutes::new(&path);

        let first = routes.current(|_| true).await.unwrap();
        assert_eq!(first.route("XX"), Route::Unknown);
        let again = routes.current(|_| true).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let bump = |text: &str, secs: u64| {
            std::fs::write(&path, text).unwrap();
            let file = std::fs::File::options().write(true).open(&path).unwrap();
            file.set_modified(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs)).unwrap();
        };

        bump("this is not toml [", 1_000);
        assert!(routes.current(|_| true).await.is_err());
        assert!(routes.current(|_| true).await.is_err());

        bump("ignored = [\"XX\"]\n", 2_000);
        let fixed = routes.current(|_| true).await.unwrap();
        assert_eq!(fixed.route("XX"), Route::Ignored);
    }
}
