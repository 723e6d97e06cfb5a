use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Local;
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::{Result, SyncError, Value};
use crate::fields::{Record, System};
use crate::sync::downstream::{Downstream, Identity, RecordKind};

#[derive(Serialize)]
struct SinkLine<'a> {
    at: String,
    system: System,
    kind: RecordKind,
    values: BTreeMap<&'a str, serde_json::Value>,
}

/// Key fields a generated id is built from, in this order.
const DRY_RUN_KEY_FIELDS: [&str; 4] = ["HotelId__c", "ReservationNo__c", "SubNo__c", "GdsNo__c"];

/// Id of a record pushed without one, stable for the same reservation key.
fn dry_run_id(values: &BTreeMap<String, Value>) -> Option<String> {
    let parts: Vec<String> = DRY_RUN_KEY_FIELDS
        .iter()
        .filter_map(|name| values.get(*name))
        .filter(|v| !v.is_empty())
        .map(Value::to_text)
        .collect();
    (!parts.is_empty()).then(|| format!("dry-{}", parts.join("-")))
}

/// Dry-run downstream appending every upserted record as one JSON line to a file. Records
/// without an `Id` are answered with an id generated from their reservation key.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    system: System,
    write_lock: Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>, system: System) -> Self {
        Self { path: path.into(), system, write_lock: Mutex::new(()) }
    }
}

#[async_trait]
impl Downstream for JsonLinesSink {
    fn system(&self) -> System {
        self.system
    }

    async fn upsert(&self, kind: RecordKind, rec: &Record) -> Result<Option<String>> {
        let values = rec.system_values(self.system);
        let line = SinkLine {
            at: Local::now().naive_local().format("%Y-%m-%d %H:%M:%S").to_string(),
            system: self.system,
            kind,
            values: values.iter().map(|(k, v)| (k.as_str(), v.to_json())).collect(),
        };
        let mut text = serde_json::to_string(&line)
            .map_err(|e| SyncError::Persistence(format!("cannot encode sink line: {}", e)))?;
        text.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path).await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        debug!(path = %self.path.display(), ?kind, "record written to sink");

        Ok(values.get("Id").filter(|v| !v.is_empty()).map(Value::to_text).or_else(|| dry_run_id(&values)))
    }

    async fn fetch(&self, _identity: &Identity) -> Result<Record> {
        Err(SyncError::Connection(format!("{} sink cannot fetch records", self.system)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{NaiveDate, NaiveDateTime};

    use crate::cache::{
        ResKey, RoomAction, RoomChange, apply_room_change, memory_store, oldest_dirty_room, touch_reservation,
    };
    use crate::fields::Field;
    use crate::store::CacheStore;
    use crate::sync::{Downstreams, SyncPass};

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 7, 1).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crm.jsonl");
        let sink = JsonLinesSink::new(&path, System::Sf);
        let mut rec = Record::new()
            .with(Field::new("ResSfId").with_name(System::Sf, "Id").with_value("006000000000001AAA"))
            .with(Field::new("ResRoomNo").with_name(System::Sf, "RoomNo__c").with_value("0101"));
        rec.push(System::Sf);

        let id = sink.upsert(RecordKind::RoomChange, &rec).await.unwrap();
        sink.upsert(RecordKind::RoomChange, &rec).await.unwrap();
        assert_eq!(id.as_deref(), Some("006000000000001AAA"));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "room_change");
        assert_eq!(first["values"]["RoomNo__c"], "0101");
    }

    #[test]
    fn test_generated_id_follows_reservation_key() {
        let values = BTreeMap::from([
            ("HotelId__c".to_string(), Value::from("4")),
            ("ReservationNo__c".to_string(), Value::from("77729")),
            ("SubNo__c".to_string(), Value::from("1")),
            ("GdsNo__c".to_string(), Value::Null),
        ]);
        assert_eq!(dry_run_id(&values).as_deref(), Some("dry-4-77729-1"));
        assert_eq!(dry_run_id(&BTreeMap::new()), None);
    }

    #[tokio::test]
    async fn test_check_in_is_synced_through_the_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crm.jsonl");
        let store = memory_store().unwrap();
        let crm = Arc::new(JsonLinesSink::new(&path, System::Sf));
        let pass = SyncPass::new(Arc::new(store.clone()), Downstreams::new(crm));
        let mut conn = store.connect().await.unwrap();
        let key = ResKey::new("1", "R1", "1");
        touch_reservation(conn.as_mut(), &key, None, at(10, 0)).await.unwrap();
        assert!(pass.run().await.is_ok());

        let change = RoomChange {
            key: key.clone(),
            action: RoomAction::CheckIn,
            room_id: Some("0101".into()),
            action_time: at(10, 3),
        };
        let sf_id = apply_room_change(conn.as_mut(), &change).await.unwrap();
        assert_eq!(sf_id.as_deref(), Some("dry-1-R1-1"));
        assert!(oldest_dirty_room(conn.as_mut()).await.unwrap().is_some());

        assert!(pass.run().await.is_ok());
        assert!(oldest_dirty_room(conn.as_mut()).await.unwrap().is_none());
        let content = std::fs::read_to_string(&path).unwrap();
        let last: serde_json::Value = serde_json::from_str(content.lines().last().unwrap()).unwrap();
        assert_eq!(last["kind"], "room_change");
        assert_eq!(last["values"]["Id"], "dry-1-R1-1");
    }
}
