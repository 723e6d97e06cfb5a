use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::cache::clients::{CONTACT_COLUMNS, ID_COLUMNS, client_pk};
use crate::cache::schema::CLIENTS;
use crate::cache::{ClientIdentity, clients_by_ext_refs, load_client, replace_ext_refs, select_clients};
use crate::core::{ColumnValues, Result, SyncError, Value};
use crate::fields::System;
use crate::store::{Predicate, StoreConnection};
use crate::upsert::{BatchItem, BatchPolicy, BatchReport, NamedLocks, Upsert, write_all};

/// How an incoming client was matched to a cache row, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKey {
    AssId,
    IdPair(System, System),
    Id(System),
    ExtRefs,
}

impl fmt::Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchKey::AssId => write!(f, "AssId"),
            MatchKey::IdPair(a, b) => write!(f, "{}Id+{}Id", a, b),
            MatchKey::Id(s) => write!(f, "{}Id", s),
            MatchKey::ExtRefs => write!(f, "ExtRefs"),
        }
    }
}

const ID_PAIRS: [(System, System); 3] = [(System::Acu, System::Sf), (System::Acu, System::Sh), (System::Sf, System::Sh)];
const SINGLE_IDS: [System; 3] = [System::Acu, System::Sf, System::Sh];

/// Cached and incoming value of a column disagreeing on a matched client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discrepancy {
    pub column: String,
    pub existing: String,
    pub incoming: String,
    pub matched_by: MatchKey,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub ass_id: i64,
    pub created: bool,
    pub matched_by: Option<MatchKey>,
    pub discrepancies: Vec<Discrepancy>,
    /// Cached client after the merge.
    pub identity: ClientIdentity,
}

fn id_column(system: System) -> &'static str {
    ID_COLUMNS.iter().find(|(_, s)| *s == system).map(|(col, _)| *col).unwrap_or("cl_pk")
}

fn column_text(cols: &ColumnValues, column: &str) -> Option<String> {
    cols.get(column).filter(|v| !v.is_empty()).map(|v| v.to_text().trim().to_string())
}

/// Finds or creates the cache client an incoming partial identity belongs to.
///
/// Matching runs through the internal key, pairs of external ids, single external ids and
/// finally shared external references; the first stage with a hit wins. On a match the
/// cached identifiers and contact data are kept and every disagreeing incoming value is
/// reported as a [`Discrepancy`]; empty cached values are filled in and external
/// references are unioned.
pub struct IdentityResolver {
    locks: Arc<NamedLocks>,
    allow_ambiguous: bool,
}

impl IdentityResolver {
    pub fn new(locks: Arc<NamedLocks>) -> Self {
        Self { locks, allow_ambiguous: true }
    }

    /// Fails with a conflict instead of picking the lowest key when a stage matches more
    /// than one client.
    pub fn strict(mut self) -> Self {
        self.allow_ambiguous = false;
        self
    }

    fn pick(&self, stage: MatchKey, mut candidates: Vec<ClientIdentity>) -> Result<Option<(MatchKey, ClientIdentity)>> {
        match candidates.len() {
            0 => Ok(None),
            1 => Ok(candidates.pop().map(|c| (stage, c))),
            n => {
                let pks: Vec<i64> = candidates.iter().filter_map(|c| c.ass_id).collect();
                if !self.allow_ambiguous {
                    return Err(SyncError::Conflict(format!(
                        "{} matches {} clients {:?}",
                        stage, n, pks
                    )));
                }
                warn!(matched_by = %stage, candidates = ?pks, "ambiguous client match; using lowest key");
                Ok(candidates.into_iter().next().map(|c| (stage, c)))
            }
        }
    }

    /// Cache client matching `incoming`, with the stage that found it.
    pub async fn find(
        &self,
        conn: &mut dyn StoreConnection,
        incoming: &ClientIdentity,
    ) -> Result<Option<(MatchKey, ClientIdentity)>> {
        if let Some(ass_id) = incoming.ass_id {
            if let Some(client) = load_client(conn, ass_id).await? {
                return Ok(Some((MatchKey::AssId, client)));
            }
            debug!(ass_id, "unknown AssId; trying external ids");
        }

        for (a, b) in ID_PAIRS {
            let (Some(id_a), Some(id_b)) = (incoming.id_of(a), incoming.id_of(b)) else { continue };
            let filter = Predicate::eq(id_column(a), id_a).and(Predicate::eq(id_column(b), id_b));
            let found = self.pick(MatchKey::IdPair(a, b), select_clients(conn, filter).await?)?;
            if found.is_some() {
                return Ok(found);
            }
        }

        for system in SINGLE_IDS {
            let Some(id) = incoming.id_of(system) else { continue };
            let found = self.pick(MatchKey::Id(system), select_clients(conn, Predicate::eq(id_column(system), id)).await?)?;
            if found.is_some() {
                return Ok(found);
            }
        }

        let pks = clients_by_ext_refs(conn, &incoming.ext_refs).await?;
        let mut candidates = Vec::with_capacity(pks.len());
        for pk in pks {
            if let Some(client) = load_client(conn, pk).await? {
                candidates.push(client);
            }
        }
        self.pick(MatchKey::ExtRefs, candidates)
    }

    pub async fn resolve(&self, conn: &mut dyn StoreConnection, incoming: &ClientIdentity) -> Result<Resolution> {
        match self.find(conn, incoming).await? {
            Some((matched_by, existing)) => self.merge(conn, matched_by, existing, incoming).await,
            None => self.create(conn, incoming).await,
        }
    }

    async fn create(&self, conn: &mut dyn StoreConnection, incoming: &ClientIdentity) -> Result<Resolution> {
        if !incoming.has_external_id() && incoming.ext_refs.is_empty() {
            return Err(SyncError::Validation(
                "client without any external id or reference cannot be created".into(),
            ));
        }
        let row = conn.insert(CLIENTS, &incoming.to_columns()).await?;
        let ass_id = client_pk(&row)?;
        if !incoming.ext_refs.is_empty() {
            replace_ext_refs(conn, &self.locks, ass_id, &incoming.ext_refs).await?;
        }
        info!(ass_id, acu_id = ?incoming.acu_id, sf_id = ?incoming.sf_id, sh_id = ?incoming.sh_id, "client created");
        let identity = ClientIdentity { ass_id: Some(ass_id), ..incoming.clone() };
        Ok(Resolution { ass_id, created: true, matched_by: None, discrepancies: Vec::new(), identity })
    }

    async fn merge(
        &self,
        conn: &mut dyn StoreConnection,
        matched_by: MatchKey,
        existing: ClientIdentity,
        incoming: &ClientIdentity,
    ) -> Result<Resolution> {
        let ass_id = existing
            .ass_id
            .ok_or_else(|| SyncError::Persistence("matched client without AssId".into()))?;
        let cached = existing.to_columns();
        let values = incoming.to_columns();

        let protected: Vec<&str> = ID_COLUMNS.iter().map(|(col, _)| *col).chain(CONTACT_COLUMNS).collect();
        let mut discrepancies = Vec::new();
        for column in &protected {
            let (Some(old), Some(new)) = (column_text(&cached, column), column_text(&values, column)) else {
                continue;
            };
            if old != new {
                warn!(
                    ass_id,
                    matched_by = %matched_by,
                    column = *column,
                    existing = %old,
                    incoming = %new,
                    "client data discrepancy; keeping cached value"
                );
                discrepancies.push(Discrepancy {
                    column: column.to_string(),
                    existing: old,
                    incoming: new,
                    matched_by,
                });
            }
        }

        if !values.is_empty() {
            Upsert::new(CLIENTS, values)
                .matching(ColumnValues::from([("cl_pk".to_string(), Value::Integer(ass_id))]))
                .locked(protected.iter().copied())
                .execute(conn)
                .await?;
        }

        let ext_refs = existing.ext_refs.union(&incoming.ext_refs);
        if ext_refs != existing.ext_refs {
            replace_ext_refs(conn, &self.locks, ass_id, &ext_refs).await?;
        }

        let identity = load_client(conn, ass_id)
            .await?
            .ok_or_else(|| SyncError::Persistence(format!("client {} vanished during merge", ass_id)))?;
        debug!(ass_id, matched_by = %matched_by, discrepancies = discrepancies.len(), "client matched");
        Ok(Resolution { ass_id, created: false, matched_by: Some(matched_by), discrepancies, identity })
    }
}

struct ClientLoad<'r> {
    resolver: &'r IdentityResolver,
    client: ClientIdentity,
}

#[async_trait]
impl BatchItem for ClientLoad<'_> {
    async fn write(&self, conn: &mut dyn StoreConnection) -> Result<()> {
        self.resolver.resolve(conn, &self.client).await.map(|_| ())
    }

    fn describe(&self) -> String {
        format!(
            "client acu={:?} sf={:?} sh={:?}",
            self.client.acu_id, self.client.sf_id, self.client.sh_id
        )
    }
}

/// Bulk load of clients through the resolver, committed every `batch_size` clients.
pub async fn load_clients(
    conn: &mut dyn StoreConnection,
    resolver: &IdentityResolver,
    clients: Vec<ClientIdentity>,
    batch_size: usize,
    policy: BatchPolicy,
) -> Result<BatchReport> {
    let items: Vec<ClientLoad<'_>> = clients.into_iter().map(|client| ClientLoad { resolver, client }).collect();
    write_all(conn, batch_size, items.iter().map(|i| i as &dyn BatchItem), policy).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory_store;
    use crate::core::ErrorKind;
    use crate::fields::ExtRefs;
    use crate::store::CacheStore;

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(Arc::new(NamedLocks::new()))
    }

    fn client(acu: Option<&str>, sf: Option<&str>, sh: Option<&str>) -> ClientIdentity {
        ClientIdentity {
            acu_id: acu.map(Into::into),
            sf_id: sf.map(Into::into),
            sh_id: sh.map(Into::into),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_creates_then_matches_by_single_id() {
        let store = memory_store().unwrap();
        let mut conn = store.connect().await.unwrap();
        let resolver = resolver();

        let first = resolver.resolve(conn.as_mut(), &client(Some("E1"), None, None)).await.unwrap();
        assert!(first.created);

        let second = resolver.resolve(conn.as_mut(), &client(Some("E1"), None, Some("77"))).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.ass_id, first.ass_id);
        assert_eq!(second.matched_by, Some(MatchKey::Id(System::Acu)));
        assert_eq!(second.identity.sh_id.as_deref(), Some("77"));
        assert!(second.discrepancies.is_empty());
    }

    #[tokio::test]
    async fn test_ass_id_beats_external_id() {
        let store = memory_store().unwrap();
        let mut conn = store.connect().await.unwrap();
        let resolver = resolver();
        let by_acu = resolver.resolve(conn.as_mut(), &client(Some("E1"), None, None)).await.unwrap();
        let by_ass = resolver.resolve(conn.as_mut(), &client(Some("E2"), None, None)).await.unwrap();

        let incoming = ClientIdentity { ass_id: Some(by_ass.ass_id), ..client(Some("E1"), None, None) };
        let resolution = resolver.resolve(conn.as_mut(), &incoming).await.unwrap();
        assert_eq!(resolution.ass_id, by_ass.ass_id);
        assert_ne!(resolution.ass_id, by_acu.ass_id);
        assert_eq!(resolution.matched_by, Some(MatchKey::AssId));
        assert_eq!(resolution.discrepancies.len(), 1);
        assert_eq!(resolution.identity.acu_id.as_deref(), Some("E2"));
    }

    #[tokio::test]
    async fn test_id_pair_beats_single_id() {
        let store = memory_store().unwrap();
        let mut conn = store.connect().await.unwrap();
        let resolver = resolver();
        resolver.resolve(conn.as_mut(), &client(Some("E1"), None, Some("1"))).await.unwrap();
        let pair = resolver.resolve(conn.as_mut(), &client(Some("E1X"), Some("001000000000001AAA"), Some("2"))).await.unwrap();
        // second client now shares the ERP id of the first one
        conn.update(CLIENTS, &Predicate::eq("cl_pk", pair.ass_id), &ColumnValues::from([("cl_ac_id".into(), Value::from("E1"))]))
            .await
            .unwrap();

        let resolution = resolver.resolve(conn.as_mut(), &client(Some("E1"), None, Some("2"))).await.unwrap();
        assert_eq!(resolution.ass_id, pair.ass_id);
        assert_eq!(resolution.matched_by, Some(MatchKey::IdPair(System::Acu, System::Sh)));
    }

    #[tokio::test]
    async fn test_ambiguity_fails_only_in_strict_mode() {
        let store = memory_store().unwrap();
        let mut conn = store.connect().await.unwrap();
        for sh in ["1", "2"] {
            conn.insert(CLIENTS, &client(Some("E1"), None, Some(sh)).to_columns()).await.unwrap();
        }
        let err = resolver().strict().resolve(conn.as_mut(), &client(Some("E1"), None, None)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let resolution = resolver().resolve(conn.as_mut(), &client(Some("E1"), None, None)).await.unwrap();
        assert_eq!(resolution.ass_id, 1);
    }

    #[tokio::test]
    async fn test_ext_refs_match_and_union() {
        let store = memory_store().unwrap();
        let mut conn = store.connect().await.unwrap();
        let resolver = resolver();
        let with_refs = |refs: &str| ClientIdentity { ext_refs: ExtRefs::parse(refs).unwrap(), ..Default::default() };

        let created = resolver.resolve(conn.as_mut(), &with_refs("RCI=1,RCI=2")).await.unwrap();
        let matched = resolver.resolve(conn.as_mut(), &with_refs("RCI=2,KEYS=3")).await.unwrap();
        assert_eq!(matched.ass_id, created.ass_id);
        assert_eq!(matched.matched_by, Some(MatchKey::ExtRefs));
        assert_eq!(matched.identity.ext_refs, ExtRefs::parse("RCI=1,RCI=2,KEYS=3").unwrap());
    }

    #[tokio::test]
    async fn test_client_without_ids_is_rejected() {
        let store = memory_store().unwrap();
        let mut conn = store.connect().await.unwrap();
        let incoming = ClientIdentity { name: Some("Nobody".into()), ..Default::default() };
        let err = resolver().resolve(conn.as_mut(), &incoming).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(store.row_count(CLIENTS).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_load_clients_in_batches() {
        let store = memory_store().unwrap();
        let mut conn = store.connect().await.unwrap();
        let resolver = resolver();
        let clients = vec![
            client(Some("E1"), None, None),
            client(Some("E2"), None, None),
            ClientIdentity::default(),
            client(Some("E1"), None, Some("5")),
        ];
        let report = load_clients(conn.as_mut(), &resolver, clients, 2, BatchPolicy::SkipAndContinue)
            .await
            .unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, 2);
        assert_eq!(report.committed, 3);
        assert_eq!(store.row_count(CLIENTS).unwrap(), 2);
    }
}
