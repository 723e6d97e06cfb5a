use chrono::NaiveDateTime;
use tracing::debug;

use crate::cache::clients::load_client;
use crate::cache::schema::{RES_GROUPS, RES_GROUP_CLIENTS};
use crate::core::{ColumnValues, Result, SyncError, Value};
use crate::fields::converters::{date_from_text, date_to_text, integer_from_text, long_id_converter};
use crate::fields::{Field, Record, Records, SyncContext, System};
use crate::store::{Predicate, Select, SortOrder, StoreConnection};
use crate::upsert::Upsert;

pub const RES_ASS_ID: &str = "ResAssId";
pub const RES_HOTEL_ID: &str = "ResHotelId";
pub const RES_ID: &str = "ResId";
pub const RES_SUB_ID: &str = "ResSubId";
pub const RES_GDS_NO: &str = "ResGdsNo";
pub const RES_SF_ID: &str = "ResSfId";
pub const RES_OBJ_ID: &str = "ResObjId";
pub const RES_ARRIVAL: &str = "ResArrival";
pub const RES_DEPARTURE: &str = "ResDeparture";
pub const RES_STATUS: &str = "ResStatus";
pub const RES_MKT_SEGMENT: &str = "ResMktSegment";
pub const RES_ORDERER_ASS_ID: &str = "ResOrdererAssId";
pub const RES_ORDERER_ACU_ID: &str = "ResOrdererAcuId";
pub const RES_ORDERER_SF_ID: &str = "ResOrdererSfId";
pub const RES_ORDERER_SH_ID: &str = "ResOrdererShId";
pub const RES_ROOM_NO: &str = "ResRoomNo";
pub const RES_CHECK_IN: &str = "ResCheckIn";
pub const RES_CHECK_OUT: &str = "ResCheckOut";
pub const RES_PERSONS: &str = "ResPersons";

pub const PERS_ROOM_SEQ: &str = "PersRoomSeq";
pub const PERS_SEQ: &str = "PersSeq";
pub const PERS_ASS_ID: &str = "PersAssId";
pub const PERS_SH_ID: &str = "PersShId";
pub const PERS_SURNAME: &str = "PersSurname";
pub const PERS_FORENAME: &str = "PersForename";
pub const PERS_ARRIVAL: &str = "PersArrival";
pub const PERS_DEPARTURE: &str = "PersDeparture";
pub const PERS_ROOM_NO: &str = "PersRoomNo";

/// The CRM opportunity id is only written while none is stored.
pub const RES_LOCKED_COLUMNS: [&str; 1] = ["rgr_sf_id"];

const SH_DATE_FORMAT: &str = "%Y-%m-%d";
const SF_DATE_FORMAT: &str = "%Y-%m-%d";

fn hotel_date(field: Field) -> Field {
    field
        .with_converter(SyncContext::from(System::Sh), date_from_text(SH_DATE_FORMAT))
        .with_converter(SyncContext::onto(System::Sh), date_to_text(SH_DATE_FORMAT))
}

/// Field template of one rooming list entry.
pub fn occupant_record() -> Record {
    Record::new()
        .with(
            Field::new(PERS_ROOM_SEQ)
                .with_name(System::Ass, "rgc_room_seq")
                .with_name(System::Sh, "ROOM-SEQ")
                .with_converter(SyncContext::from(System::Sh), integer_from_text),
        )
        .with(
            Field::new(PERS_SEQ)
                .with_name(System::Ass, "rgc_pers_seq")
                .with_name(System::Sh, "PERS-SEQ")
                .with_converter(SyncContext::from(System::Sh), integer_from_text),
        )
        .with(Field::new(PERS_ASS_ID).with_name(System::Ass, "rgc_cl_fk"))
        .with(Field::new(PERS_SH_ID).with_name(System::Sh, "GUEST-ID").with_name(System::Sf, "SihotGuestObjId__c"))
        .with(
            Field::new(PERS_SURNAME)
                .with_name(System::Ass, "rgc_surname")
                .with_name(System::Sh, "NAME")
                .with_name(System::Sf, "LastName__c"),
        )
        .with(
            Field::new(PERS_FORENAME)
                .with_name(System::Ass, "rgc_firstname")
                .with_name(System::Sh, "NAME2")
                .with_name(System::Sf, "FirstName__c"),
        )
        .with(hotel_date(Field::new(PERS_ARRIVAL).with_name(System::Ass, "rgc_arrival").with_name(System::Sh, "ARR")))
        .with(hotel_date(Field::new(PERS_DEPARTURE).with_name(System::Ass, "rgc_departure").with_name(System::Sh, "DEP")))
        .with(
            Field::new(PERS_ROOM_NO)
                .with_name(System::Ass, "rgc_room_id")
                .with_name(System::Sh, "RN")
                .with_name(System::Sf, "RoomNo__c"),
        )
}

/// Field template of a reservation with an empty rooming list.
pub fn reservation_record() -> Record {
    Record::new()
        .with(Field::new(RES_ASS_ID).with_name(System::Ass, "rgr_pk"))
        .with(
            Field::new(RES_HOTEL_ID)
                .with_name(System::Ass, "rgr_ho_fk")
                .with_name(System::Sh, "HN")
                .with_name(System::Sf, "HotelId__c"),
        )
        .with(
            Field::new(RES_ID)
                .with_name(System::Ass, "rgr_res_id")
                .with_name(System::Sh, "RES-NR")
                .with_name(System::Sf, "ReservationNo__c"),
        )
        .with(
            Field::new(RES_SUB_ID)
                .with_name(System::Ass, "rgr_sub_id")
                .with_name(System::Sh, "SUB-NR")
                .with_name(System::Sf, "SubNo__c"),
        )
        .with(
            Field::new(RES_GDS_NO)
                .with_name(System::Ass, "rgr_gds_no")
                .with_name(System::Sh, "GDSNO")
                .with_name(System::Sf, "GdsNo__c"),
        )
        .with(
            Field::new(RES_SF_ID)
                .with_name(System::Ass, "rgr_sf_id")
                .with_name(System::Sf, "Id")
                .with_converter(SyncContext::from(System::Sf), long_id_converter),
        )
        .with(
            Field::new(RES_OBJ_ID)
                .with_name(System::Ass, "rgr_obj_id")
                .with_name(System::Sh, "OBJID")
                .with_name(System::Sf, "SihotResvObjectId__c"),
        )
        .with(
            hotel_date(Field::new(RES_ARRIVAL).with_name(System::Ass, "rgr_arrival").with_name(System::Sh, "ARR"))
                .with_name(System::Sf, "Arrival__c")
                .with_converter(SyncContext::onto(System::Sf), date_to_text(SF_DATE_FORMAT)),
        )
        .with(
            hotel_date(Field::new(RES_DEPARTURE).with_name(System::Ass, "rgr_departure").with_name(System::Sh, "DEP"))
                .with_name(System::Sf, "Departure__c")
                .with_converter(SyncContext::onto(System::Sf), date_to_text(SF_DATE_FORMAT)),
        )
        .with(
            Field::new(RES_STATUS)
                .with_name(System::Ass, "rgr_status")
                .with_name(System::Sh, "RT")
                .with_name(System::Sf, "Status__c"),
        )
        .with(
            Field::new(RES_MKT_SEGMENT)
                .with_name(System::Ass, "rgr_mkt_segment")
                .with_name(System::Sh, "MC")
                .with_name(System::Sf, "MktSegment__c"),
        )
        .with(Field::new(RES_ORDERER_ASS_ID).with_name(System::Ass, "rgr_order_cl_fk"))
        .with(Field::new(RES_ORDERER_ACU_ID).with_name(System::Sf, "AcumenClientRef__c"))
        .with(Field::new(RES_ORDERER_SF_ID).with_name(System::Sf, "PersonAccountId__c"))
        .with(
            Field::new(RES_ORDERER_SH_ID)
                .with_name(System::Sh, "GUEST-ID")
                .with_name(System::Sf, "SihotGuestObjId__c"),
        )
        .with(
            Field::new(RES_ROOM_NO)
                .with_name(System::Ass, "rgr_room_id")
                .with_name(System::Sh, "RN")
                .with_name(System::Sf, "RoomNo__c"),
        )
        .with(Field::new(RES_CHECK_IN).with_name(System::Ass, "rgr_time_in").with_name(System::Sf, "CheckIn__c"))
        .with(Field::new(RES_CHECK_OUT).with_name(System::Ass, "rgr_time_out").with_name(System::Sf, "CheckOut__c"))
        .with(
            Field::new(RES_PERSONS)
                .with_name(System::Sh, "PERSON")
                .with_name(System::Sf, "Occupants__c")
                .with_list(Vec::new()),
        )
}

/// Replaces the rooming list of `rec`.
pub fn set_rooming(rec: &mut Record, persons: Records) {
    if let Some(field) = rec.field_mut(RES_PERSONS) {
        *field = field.cleared().with_list(persons);
    }
}

fn opt_text(value: Option<&Value>) -> Option<String> {
    value.cloned().and_then(|v| match v.normalized() {
        Value::Null => None,
        v => Some(v.to_text()),
    })
}

/// Hotel-side key of a reservation: hotel id plus either the GDS number or the
/// reservation number and sub number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResKey {
    pub hotel_id: String,
    pub res_id: Option<String>,
    pub sub_id: Option<String>,
    pub gds_no: Option<String>,
}

impl ResKey {
    pub fn new(hotel_id: impl Into<String>, res_id: impl Into<String>, sub_id: impl Into<String>) -> Self {
        let non_empty = |s: String| (!s.trim().is_empty()).then(|| s.trim().to_string());
        Self {
            hotel_id: hotel_id.into().trim().to_string(),
            res_id: non_empty(res_id.into()),
            sub_id: non_empty(sub_id.into()),
            gds_no: None,
        }
    }

    pub fn with_gds_no(mut self, gds_no: impl Into<String>) -> Self {
        let gds_no = gds_no.into();
        self.gds_no = (!gds_no.trim().is_empty()).then(|| gds_no.trim().to_string());
        self
    }

    pub fn from_record(rec: &Record) -> Self {
        Self {
            hotel_id: rec.val(RES_HOTEL_ID).to_text(),
            res_id: opt_text(Some(&rec.val(RES_ID))),
            sub_id: opt_text(Some(&rec.val(RES_SUB_ID))),
            gds_no: opt_text(Some(&rec.val(RES_GDS_NO))),
        }
    }

    pub fn from_row(row: &ColumnValues) -> Self {
        Self {
            hotel_id: opt_text(row.get("rgr_ho_fk")).unwrap_or_default(),
            res_id: opt_text(row.get("rgr_res_id")),
            sub_id: opt_text(row.get("rgr_sub_id")),
            gds_no: opt_text(row.get("rgr_gds_no")),
        }
    }

    /// Match values for the `res_groups` upsert; the GDS number wins when present.
    pub fn match_values(&self) -> Result<ColumnValues> {
        if self.hotel_id.is_empty() {
            return Err(SyncError::Validation(format!("reservation {} without hotel id", self)));
        }
        let mut values = ColumnValues::new();
        values.insert("rgr_ho_fk".into(), Value::from(self.hotel_id.as_str()));
        match (&self.gds_no, &self.res_id, &self.sub_id) {
            (Some(gds_no), _, _) => {
                values.insert("rgr_gds_no".into(), Value::from(gds_no.as_str()));
            }
            (None, Some(res_id), Some(sub_id)) => {
                values.insert("rgr_res_id".into(), Value::from(res_id.as_str()));
                values.insert("rgr_sub_id".into(), Value::from(sub_id.as_str()));
            }
            _ => {
                return Err(SyncError::Validation(format!(
                    "reservation {} is missing its id (GDS number or reservation/sub number)",
                    self
                )));
            }
        }
        Ok(values)
    }

    /// Key columns to store along with a write.
    fn columns(&self) -> ColumnValues {
        let mut values = ColumnValues::new();
        values.insert("rgr_ho_fk".into(), Value::from(self.hotel_id.as_str()));
        values.insert("rgr_res_id".into(), self.res_id.clone().into());
        values.insert("rgr_sub_id".into(), self.sub_id.clone().into());
        values.insert("rgr_gds_no".into(), self.gds_no.clone().into());
        values.retain(|_, v| !v.is_empty());
        values
    }
}

impl std::fmt::Display for ResKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.res_id.as_deref().unwrap_or("?"),
            self.sub_id.as_deref().unwrap_or("?"),
            self.hotel_id
        )?;
        if let Some(gds_no) = &self.gds_no {
            write!(f, " (GDS {})", gds_no)?;
        }
        Ok(())
    }
}

fn row_pk(row: &ColumnValues) -> Result<i64> {
    row.get("rgr_pk")
        .and_then(Value::as_i64)
        .ok_or_else(|| SyncError::Persistence("reservation row without primary key".into()))
}

/// Loads a cached reservation, rooming list and orderer ids included.
pub async fn load_reservation(conn: &mut dyn StoreConnection, rgr_pk: i64) -> Result<Option<Record>> {
    let rows = conn
        .select(&Select::from(RES_GROUPS).filter(Predicate::eq("rgr_pk", rgr_pk)))
        .await?;
    let Some(row) = rows.into_iter().next() else {
        return Ok(None);
    };
    let mut rec = reservation_record();
    rec.set_system_values(System::Ass, &row);

    let occupants = conn
        .select(
            &Select::from(RES_GROUP_CLIENTS)
                .filter(Predicate::eq("rgc_rgr_fk", rgr_pk))
                .order_by("rgc_room_seq", SortOrder::Asc)
                .order_by("rgc_pers_seq", SortOrder::Asc),
        )
        .await?;
    let persons: Records = occupants
        .iter()
        .map(|occ_row| {
            let mut occ = occupant_record();
            occ.set_system_values(System::Ass, occ_row);
            occ
        })
        .collect();
    set_rooming(&mut rec, persons);
    rec.pull(System::Ass);

    if let Some(orderer) = row.get("rgr_order_cl_fk").and_then(Value::as_i64)
        && let Some(client) = load_client(conn, orderer).await?
    {
        rec.set_val(RES_ORDERER_ACU_ID, client.acu_id);
        rec.set_val(RES_ORDERER_SF_ID, client.sf_id);
        rec.set_val(RES_ORDERER_SH_ID, client.sh_id);
    }
    Ok(Some(rec))
}

/// Writes the reservation header and its rooming list; returns the reservation key.
///
/// Empty values never blank stored columns and a stored CRM id is kept.
pub async fn save_reservation(conn: &mut dyn StoreConnection, rec: &Record) -> Result<i64> {
    let mut rec = rec.clone();
    rec.push(System::Ass);

    let match_values = match rec.val(RES_ASS_ID).as_i64() {
        Some(pk) => ColumnValues::from([("rgr_pk".to_string(), Value::Integer(pk))]),
        None => ResKey::from_record(&rec).match_values()?,
    };
    let mut cols = rec.to_columns(System::Ass);
    cols.remove("rgr_pk");
    let outcome = Upsert::new(RES_GROUPS, cols)
        .matching(match_values)
        .locked(RES_LOCKED_COLUMNS)
        .returning("rgr_pk")
        .execute(conn)
        .await?;
    let rgr_pk = outcome
        .key
        .and_then(|k| k.as_i64())
        .ok_or_else(|| SyncError::Persistence("reservation upsert returned no key".into()))?;

    for (idx, occ) in rec.rooming(RES_PERSONS).iter().enumerate() {
        let mut cols = occ.to_columns(System::Ass);
        let room_seq = cols.get("rgc_room_seq").and_then(Value::as_i64).unwrap_or(0);
        let pers_seq = cols.get("rgc_pers_seq").and_then(Value::as_i64).unwrap_or(idx as i64);
        let match_values = ColumnValues::from([
            ("rgc_rgr_fk".to_string(), Value::Integer(rgr_pk)),
            ("rgc_room_seq".to_string(), Value::Integer(room_seq)),
            ("rgc_pers_seq".to_string(), Value::Integer(pers_seq)),
        ]);
        cols.extend(match_values.clone());
        Upsert::new(RES_GROUP_CLIENTS, cols).matching(match_values).execute(conn).await?;
    }
    debug!(rgr_pk, occupants = rec.rooming(RES_PERSONS).len(), "reservation saved");
    Ok(rgr_pk)
}

/// Marks the reservation data as changed at `changed_at`, creating the row if needed.
pub async fn touch_reservation(
    conn: &mut dyn StoreConnection,
    key: &ResKey,
    obj_id: Option<&str>,
    changed_at: NaiveDateTime,
) -> Result<i64> {
    let mut values = key.columns();
    values.insert("rgr_last_change".into(), Value::Timestamp(changed_at));
    if let Some(obj_id) = obj_id.filter(|id| !id.trim().is_empty()) {
        values.insert("rgr_obj_id".into(), Value::from(obj_id));
    }
    let outcome = Upsert::new(RES_GROUPS, values)
        .matching(key.match_values()?)
        .returning("rgr_pk")
        .execute(conn)
        .await?;
    outcome
        .key
        .and_then(|k| k.as_i64())
        .ok_or_else(|| SyncError::Persistence(format!("reservation {} has no primary key", key)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomAction {
    /// Guest checked in (`CI`, `CI-RM`).
    CheckIn,
    /// Guest checked out (`CO`, `CO-RM`).
    CheckOut,
    /// Only the room number changed (`RC-RM`).
    RoomNumber,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoomChange {
    pub key: ResKey,
    pub action: RoomAction,
    pub room_id: Option<String>,
    pub action_time: NaiveDateTime,
}

/// Stores an occupancy event and marks the room data dirty. Returns the CRM id of the
/// reservation, if it has one.
pub async fn apply_room_change(conn: &mut dyn StoreConnection, change: &RoomChange) -> Result<Option<String>> {
    let mut values = change.key.columns();
    let at = Value::Timestamp(change.action_time);
    let room: Value = change.room_id.clone().into();
    match change.action {
        RoomAction::CheckIn => {
            values.insert("rgr_time_in".into(), at.clone());
            values.insert("rgr_room_id".into(), room);
        }
        RoomAction::CheckOut => {
            values.insert("rgr_time_out".into(), at.clone());
        }
        RoomAction::RoomNumber => {
            values.insert("rgr_room_id".into(), room);
        }
    }
    values.insert("rgr_room_last_change".into(), at);
    values.retain(|_, v| !v.is_empty());

    let outcome = Upsert::new(RES_GROUPS, values)
        .matching(change.key.match_values()?)
        .returning("rgr_sf_id")
        .execute(conn)
        .await?;
    debug!(key = %change.key, action = ?change.action, "room change stored");
    Ok(outcome.key.and_then(|k| opt_text(Some(&k))))
}

/// Oldest reservation whose data changed after its last sync.
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyReservation {
    pub rgr_pk: i64,
    pub key: ResKey,
    pub sf_id: Option<String>,
    pub obj_id: Option<String>,
    pub last_change: NaiveDateTime,
}

/// Oldest reservation whose room data changed after its last room sync.
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyRoom {
    pub rgr_pk: i64,
    pub key: ResKey,
    pub sf_id: String,
    pub room_id: Option<String>,
    pub time_in: Option<NaiveDateTime>,
    pub time_out: Option<NaiveDateTime>,
    pub room_last_change: NaiveDateTime,
}

fn dirty_filter(change_col: &str, sync_col: &str) -> Predicate {
    Predicate::NotNull(change_col.to_string()).and(Predicate::Or(vec![
        Predicate::IsNull(sync_col.to_string()),
        Predicate::GreaterThanColumn(change_col.to_string(), sync_col.to_string()),
    ]))
}

async fn oldest(conn: &mut dyn StoreConnection, filter: Predicate, change_col: &str) -> Result<Option<ColumnValues>> {
    let rows = conn
        .select(
            &Select::from(RES_GROUPS)
                .filter(filter)
                .order_by(change_col, SortOrder::Asc)
                .order_by("rgr_pk", SortOrder::Asc)
                .limit(1),
        )
        .await?;
    Ok(rows.into_iter().next())
}

pub async fn oldest_dirty_reservation(conn: &mut dyn StoreConnection) -> Result<Option<DirtyReservation>> {
    let filter = dirty_filter("rgr_last_change", "rgr_last_sync");
    let Some(row) = oldest(conn, filter, "rgr_last_change").await? else {
        return Ok(None);
    };
    let last_change = row
        .get("rgr_last_change")
        .and_then(Value::as_timestamp)
        .ok_or_else(|| SyncError::Persistence("dirty reservation without change timestamp".into()))?;
    Ok(Some(DirtyReservation {
        rgr_pk: row_pk(&row)?,
        key: ResKey::from_row(&row),
        sf_id: opt_text(row.get("rgr_sf_id")),
        obj_id: opt_text(row.get("rgr_obj_id")),
        last_change,
    }))
}

/// Only reservations already known to the CRM take part in room syncs.
pub async fn oldest_dirty_room(conn: &mut dyn StoreConnection) -> Result<Option<DirtyRoom>> {
    let filter = Predicate::NotNull("rgr_sf_id".into()).and(dirty_filter("rgr_room_last_change", "rgr_room_last_sync"));
    let Some(row) = oldest(conn, filter, "rgr_room_last_change").await? else {
        return Ok(None);
    };
    let room_last_change = row
        .get("rgr_room_last_change")
        .and_then(Value::as_timestamp)
        .ok_or_else(|| SyncError::Persistence("dirty room without change timestamp".into()))?;
    Ok(Some(DirtyRoom {
        rgr_pk: row_pk(&row)?,
        key: ResKey::from_row(&row),
        sf_id: opt_text(row.get("rgr_sf_id")).unwrap_or_default(),
        room_id: opt_text(row.get("rgr_room_id")),
        time_in: row.get("rgr_time_in").and_then(Value::as_timestamp),
        time_out: row.get("rgr_time_out").and_then(Value::as_timestamp),
        room_last_change,
    }))
}

/// Check-in/out payload of a room sync.
pub fn room_record(room: &DirtyRoom) -> Record {
    let mut rec = reservation_record()
        .copy(|path, _| matches!(path.leaf_name(), Some(RES_SF_ID | RES_CHECK_IN | RES_CHECK_OUT | RES_ROOM_NO)));
    rec.set_val(RES_SF_ID, room.sf_id.as_str());
    rec.set_val(RES_CHECK_IN, room.time_in);
    rec.set_val(RES_CHECK_OUT, room.time_out);
    rec.set_val(RES_ROOM_NO, room.room_id.clone());
    rec
}

async fn advance(conn: &mut dyn StoreConnection, rgr_pk: i64, values: ColumnValues) -> Result<()> {
    Upsert::new(RES_GROUPS, values)
        .matching(ColumnValues::from([("rgr_pk".to_string(), Value::Integer(rgr_pk))]))
        .locked(RES_LOCKED_COLUMNS)
        .execute(conn)
        .await
        .map(|_| ())
}

/// Sets the data watermark to `synced_at` and stores `sf_id` unless one is stored already.
pub async fn advance_res_watermark(
    conn: &mut dyn StoreConnection,
    rgr_pk: i64,
    synced_at: NaiveDateTime,
    sf_id: Option<&str>,
) -> Result<()> {
    let mut values = ColumnValues::from([("rgr_last_sync".to_string(), Value::Timestamp(synced_at))]);
    if let Some(sf_id) = sf_id.filter(|id| !id.trim().is_empty()) {
        values.insert("rgr_sf_id".into(), Value::from(sf_id));
    }
    advance(conn, rgr_pk, values).await
}

pub async fn advance_room_watermark(conn: &mut dyn StoreConnection, rgr_pk: i64, synced_at: NaiveDateTime) -> Result<()> {
    advance(
        conn,
        rgr_pk,
        ColumnValues::from([("rgr_room_last_sync".to_string(), Value::Timestamp(synced_at))]),
    )
    .await
}
