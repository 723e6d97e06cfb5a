use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::cache::{
    DirtyReservation, DirtyRoom, advance_res_watermark, advance_room_watermark, load_reservation,
    oldest_dirty_reservation, oldest_dirty_room, room_record, save_reservation,
};
use crate::core::{Result, SyncError};
use crate::store::{CacheStore, StoreConnection};
use crate::sync::downstream::{Downstreams, Identity, RecordKind};

/// Result of one drain loop.
#[derive(Debug, Default)]
pub struct PassOutcome {
    pub synced: usize,
    /// Error that stopped the drain loop; the failing record stays dirty.
    pub error: Option<SyncError>,
}

impl PassOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// One unit of scheduled work.
#[async_trait]
pub trait PassRunner: Send + Sync {
    async fn run_pass(&self) -> PassOutcome;
}

enum Next {
    Reservation(DirtyReservation),
    Room(DirtyRoom),
}

/// Pushes dirty reservations and room changes to the CRM, oldest change first.
pub struct SyncPass {
    store: Arc<dyn CacheStore>,
    downstreams: Downstreams,
}

impl SyncPass {
    pub fn new(store: Arc<dyn CacheStore>, downstreams: Downstreams) -> Self {
        Self { store, downstreams }
    }

    /// Drains all dirty records through a connection private to this pass. Stops at the
    /// first error.
    pub async fn run(&self) -> PassOutcome {
        let mut conn = match self.store.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "sync pass cannot reach the cache store");
                return PassOutcome { synced: 0, error: Some(e) };
            }
        };

        let mut outcome = PassOutcome::default();
        loop {
            match self.step(conn.as_mut()).await {
                Ok(true) => outcome.synced += 1,
                Ok(false) => break,
                Err(e) => {
                    if conn.in_transaction()
                        && let Err(rollback) = conn.rollback().await
                    {
                        warn!(error = %rollback, "rollback after failed sync failed");
                    }
                    error!(error = %e, synced = outcome.synced, "sync pass stopped");
                    outcome.error = Some(e);
                    break;
                }
            }
        }
        if let Err(e) = conn.close().await {
            warn!(error = %e, "closing sync pass connection failed");
        }
        info!(synced = outcome.synced, failed = outcome.error.is_some(), "sync pass finished");
        outcome
    }

    /// Syncs the single oldest dirty record; `false` when nothing is dirty.
    async fn step(&self, conn: &mut dyn StoreConnection) -> Result<bool> {
        let reservation = oldest_dirty_reservation(conn).await?;
        let room = oldest_dirty_room(conn).await?;
        let next = match (reservation, room) {
            (Some(res), Some(room)) if room.room_last_change < res.last_change => Next::Room(room),
            (Some(res), _) => Next::Reservation(res),
            (None, Some(room)) => Next::Room(room),
            (None, None) => return Ok(false),
        };
        match next {
            Next::Reservation(dirty) => self.sync_reservation(conn, dirty).await?,
            Next::Room(dirty) => self.sync_room(conn, dirty).await?,
        }
        Ok(true)
    }

    async fn sync_reservation(&self, conn: &mut dyn StoreConnection, dirty: DirtyReservation) -> Result<()> {
        debug!(rgr_pk = dirty.rgr_pk, key = %dirty.key, last_change = %dirty.last_change, "syncing reservation");
        let mut rec = load_reservation(conn, dirty.rgr_pk)
            .await?
            .ok_or_else(|| SyncError::Persistence(format!("dirty reservation {} vanished", dirty.rgr_pk)))?;

        // no store transaction may span a downstream call
        if let Some(hotel) = &self.downstreams.hotel {
            let fetched = hotel.fetch(&Identity::Reservation(dirty.key.clone())).await?;
            let merged = rec.merge(&fetched, |_, _| true);
            debug!(rgr_pk = dirty.rgr_pk, merged, "hotel reservation merged");
            conn.begin().await?;
            save_reservation(conn, &rec).await?;
            conn.commit().await?;
        }

        let crm = &self.downstreams.crm;
        rec.push(crm.system());
        let sf_id = crm.upsert(RecordKind::Reservation, &rec.project(crm.system())).await?;
        advance_res_watermark(conn, dirty.rgr_pk, dirty.last_change, sf_id.as_deref()).await?;
        info!(rgr_pk = dirty.rgr_pk, key = %dirty.key, ?sf_id, "reservation synced");
        Ok(())
    }

    async fn sync_room(&self, conn: &mut dyn StoreConnection, dirty: DirtyRoom) -> Result<()> {
        debug!(rgr_pk = dirty.rgr_pk, sf_id = %dirty.sf_id, room_last_change = %dirty.room_last_change, "syncing room change");
        let crm = &self.downstreams.crm;
        let mut rec = room_record(&dirty);
        rec.push(crm.system());
        crm.upsert(RecordKind::RoomChange, &rec).await?;
        advance_room_watermark(conn, dirty.rgr_pk, dirty.room_last_change).await?;
        info!(rgr_pk = dirty.rgr_pk, room = ?dirty.room_id, "room change synced");
        Ok(())
    }
}

#[async_trait]
impl PassRunner for SyncPass {
    async fn run_pass(&self) -> PassOutcome {
        self.run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::{NaiveDate, NaiveDateTime};

    use crate::cache::reservations::RES_STATUS;
    use crate::cache::{
        ResKey, RoomAction, RoomChange, apply_room_change, memory_store, reservation_record, touch_reservation,
    };
    use crate::core::{ColumnValues, Value};
    use crate::fields::{Record, System};
    use crate::store::{MemoryStore, Predicate, Select};
    use crate::sync::downstream::Downstream;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 7, 1).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    #[derive(Default)]
    struct Crm {
        calls: Mutex<Vec<(RecordKind, String)>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl Downstream for Crm {
        fn system(&self) -> System {
            System::Sf
        }

        async fn upsert(&self, kind: RecordKind, rec: &Record) -> Result<Option<String>> {
            let values = rec.system_values(System::Sf);
            let label = values
                .get("ReservationNo__c")
                .or_else(|| values.get("RoomNo__c"))
                .map(|v| v.to_text())
                .unwrap_or_default();
            if self.fail_on.as_deref() == Some(label.as_str()) {
                return Err(SyncError::Connection("CRM down".into()));
            }
            self.calls.lock().unwrap().push((kind, label.clone()));
            Ok(Some(format!("SF-{}", label)))
        }

        async fn fetch(&self, _identity: &Identity) -> Result<Record> {
            Err(SyncError::Connection("not supported".into()))
        }
    }

    async fn seeded() -> MemoryStore {
        let store = memory_store().unwrap();
        let mut conn = store.connect().await.unwrap();
        touch_reservation(conn.as_mut(), &ResKey::new("1", "R2", "1"), None, at(10, 30)).await.unwrap();
        touch_reservation(conn.as_mut(), &ResKey::new("1", "R1", "1"), None, at(10, 0)).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_pass_syncs_in_change_order_and_advances_to_snapshot() {
        let store = seeded().await;
        let crm = Arc::new(Crm::default());
        let pass = SyncPass::new(Arc::new(store.clone()), Downstreams::new(crm.clone()));

        let outcome = pass.run().await;
        assert!(outcome.is_ok());
        assert_eq!(outcome.synced, 2);
        let labels: Vec<String> = crm.calls.lock().unwrap().iter().map(|(_, l)| l.clone()).collect();
        assert_eq!(labels, vec!["R1", "R2"]);

        let mut conn = store.connect().await.unwrap();
        let rec = load_reservation(conn.as_mut(), 2).await.unwrap().unwrap();
        assert_eq!(rec.val("ResSfId").to_text(), "SF-R1");
        assert!(oldest_dirty_reservation(conn.as_mut()).await.unwrap().is_none());
        assert_eq!(pass.run().await.synced, 0);
    }

    #[tokio::test]
    async fn test_failure_stops_pass_and_keeps_record_dirty() {
        let store = seeded().await;
        let crm = Arc::new(Crm { fail_on: Some("R1".into()), ..Default::default() });
        let pass = SyncPass::new(Arc::new(store.clone()), Downstreams::new(crm.clone()));

        let outcome = pass.run().await;
        assert_eq!(outcome.synced, 0);
        assert!(outcome.error.is_some());
        assert!(crm.calls.lock().unwrap().is_empty());

        let mut conn = store.connect().await.unwrap();
        let dirty = oldest_dirty_reservation(conn.as_mut()).await.unwrap().unwrap();
        assert_eq!(dirty.key.res_id.as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn test_room_change_interleaves_by_timestamp() {
        let store = seeded().await;
        let crm = Arc::new(Crm::default());
        let pass = SyncPass::new(Arc::new(store.clone()), Downstreams::new(crm.clone()));
        assert_eq!(pass.run().await.synced, 2);

        let mut conn = store.connect().await.unwrap();
        let key = ResKey::new("1", "R1", "1");
        apply_room_change(
            conn.as_mut(),
            &RoomChange { key: key.clone(), action: RoomAction::CheckIn, room_id: Some("0101".into()), action_time: at(11, 0) },
        )
        .await
        .unwrap();
        touch_reservation(conn.as_mut(), &ResKey::new("1", "R2", "1"), None, at(11, 0)).await.unwrap();

        assert_eq!(pass.run().await.synced, 2);
        let kinds: Vec<RecordKind> = crm.calls.lock().unwrap().iter().skip(2).map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec![RecordKind::Reservation, RecordKind::RoomChange]);
    }

    #[tokio::test]
    async fn test_unreachable_store_reports_error() {
        let store = seeded().await;
        store.set_available(false);
        let pass = SyncPass::new(Arc::new(store), Downstreams::new(Arc::new(Crm::default())));
        let outcome = pass.run().await;
        assert_eq!(outcome.error.map(|e| e.kind()), Some(crate::core::ErrorKind::Connection));
    }

    /// Hotel system returning a fixed reservation status, or failing without one.
    struct Hotel {
        status: Option<&'static str>,
    }

    #[async_trait]
    impl Downstream for Hotel {
        fn system(&self) -> System {
            System::Sh
        }

        async fn upsert(&self, _kind: RecordKind, _rec: &Record) -> Result<Option<String>> {
            Ok(None)
        }

        async fn fetch(&self, _identity: &Identity) -> Result<Record> {
            let Some(status) = self.status else {
                return Err(SyncError::Connection("hotel system down".into()));
            };
            let mut rec = reservation_record();
            rec.set_val(RES_STATUS, status);
            Ok(rec)
        }
    }

    /// CRM that records pushed values. With `check_in_from` set it stores a check-in through
    /// its own connection while the upsert is in flight and then fails.
    #[derive(Default)]
    struct RecordingCrm {
        seen: Mutex<Vec<ColumnValues>>,
        check_in_from: Option<MemoryStore>,
    }

    #[async_trait]
    impl Downstream for RecordingCrm {
        fn system(&self) -> System {
            System::Sf
        }

        async fn upsert(&self, _kind: RecordKind, rec: &Record) -> Result<Option<String>> {
            self.seen.lock().unwrap().push(rec.system_values(System::Sf));
            if let Some(store) = &self.check_in_from {
                let mut conn = store.connect().await?;
                let change = RoomChange {
                    key: ResKey::new("1", "R1", "1"),
                    action: RoomAction::CheckIn,
                    room_id: Some("0101".into()),
                    action_time: at(10, 3),
                };
                apply_room_change(conn.as_mut(), &change).await?;
                return Err(SyncError::Connection("CRM down".into()));
            }
            Ok(Some("a0B000000000001AAA".into()))
        }

        async fn fetch(&self, _identity: &Identity) -> Result<Record> {
            Err(SyncError::Connection("not supported".into()))
        }
    }

    async fn single_dirty() -> MemoryStore {
        let store = memory_store().unwrap();
        let mut conn = store.connect().await.unwrap();
        touch_reservation(conn.as_mut(), &ResKey::new("1", "R1", "1"), None, at(10, 0)).await.unwrap();
        store
    }

    async fn res_row(store: &MemoryStore) -> ColumnValues {
        let mut conn = store.connect().await.unwrap();
        let rows = conn.select(&Select::from("res_groups").filter(Predicate::eq("rgr_pk", 1_i64))).await.unwrap();
        rows.into_iter().next().unwrap()
    }

    #[tokio::test]
    async fn test_hotel_values_are_merged_saved_and_pushed() {
        let store = single_dirty().await;
        let crm = Arc::new(RecordingCrm::default());
        let downstreams = Downstreams::new(crm.clone()).with_hotel(Arc::new(Hotel { status: Some("S") }));
        let pass = SyncPass::new(Arc::new(store.clone()), downstreams);

        let outcome = pass.run().await;
        assert!(outcome.is_ok());
        assert_eq!(outcome.synced, 1);
        assert_eq!(crm.seen.lock().unwrap()[0].get("Status__c"), Some(&Value::from("S")));

        let row = res_row(&store).await;
        assert_eq!(row["rgr_status"], Value::from("S"));
        assert_eq!(row["rgr_last_sync"], Value::Timestamp(at(10, 0)));
        assert_eq!(row["rgr_sf_id"], Value::from("a0B000000000001AAA"));
    }

    #[tokio::test]
    async fn test_hotel_fetch_failure_keeps_record_dirty() {
        let store = single_dirty().await;
        let crm = Arc::new(RecordingCrm::default());
        let downstreams = Downstreams::new(crm.clone()).with_hotel(Arc::new(Hotel { status: None }));
        let pass = SyncPass::new(Arc::new(store.clone()), downstreams);

        let outcome = pass.run().await;
        assert_eq!(outcome.error.map(|e| e.kind()), Some(crate::core::ErrorKind::Connection));
        assert!(crm.seen.lock().unwrap().is_empty());

        let mut conn = store.connect().await.unwrap();
        let dirty = oldest_dirty_reservation(conn.as_mut()).await.unwrap().unwrap();
        assert_eq!(dirty.rgr_pk, 1);
    }

    #[tokio::test]
    async fn test_failed_crm_upsert_keeps_concurrent_check_in() {
        let store = single_dirty().await;
        let crm = Arc::new(RecordingCrm { check_in_from: Some(store.clone()), ..Default::default() });
        let downstreams = Downstreams::new(crm.clone()).with_hotel(Arc::new(Hotel { status: Some("S") }));
        let pass = SyncPass::new(Arc::new(store.clone()), downstreams);

        let outcome = pass.run().await;
        assert!(outcome.error.is_some());

        let row = res_row(&store).await;
        assert_eq!(row["rgr_room_id"], Value::from("0101"));
        assert_eq!(row["rgr_time_in"], Value::Timestamp(at(10, 3)));
        assert_eq!(row["rgr_room_last_change"], Value::Timestamp(at(10, 3)));
        // merged hotel data stays stored, the reservation stays dirty
        assert_eq!(row["rgr_status"], Value::from("S"));
        assert!(row["rgr_last_sync"].is_empty());
    }
}
