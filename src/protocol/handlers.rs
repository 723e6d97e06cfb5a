use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use tracing::{debug, info};

use crate::cache::reservations::{
    PERS_ASS_ID, PERS_SH_ID, RES_MKT_SEGMENT, RES_OBJ_ID, RES_ORDERER_ASS_ID, RES_ORDERER_SH_ID, RES_PERSONS,
};
use crate::cache::{
    ClientIdentity, ResKey, RoomAction, RoomChange, apply_room_change, save_reservation, set_rooming, touch_reservation,
};
use crate::core::{Result, SyncError, Value};
use crate::identity::IdentityResolver;
use crate::protocol::parse::{Request, RequestBody, RoomNotice};
use crate::store::StoreConnection;
use crate::sync::Clock;

/// Everything a handler may touch while processing one request.
pub struct HandlerContext<'a> {
    pub conn: &'a mut dyn StoreConnection,
    pub resolver: &'a IdentityResolver,
    pub clock: &'a dyn Clock,
    /// Market segments whose reservations are acknowledged but not stored.
    pub skip_market_segments: &'a [String],
}

impl HandlerContext<'_> {
    fn skips_segment(&self, segment: Option<&str>) -> bool {
        segment.is_some_and(|segment| self.skip_market_segments.iter().any(|s| s == segment))
    }
}

/// One step of an operation code's handler chain.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &mut HandlerContext<'_>, request: &Request) -> Result<()>;
}

fn wrong_shape(handler: &dyn Handler, request: &Request) -> SyncError {
    SyncError::Protocol(format!("handler {} cannot process a {} request", handler.name(), request.shape))
}

/// Accepts link-alive and time-sync requests.
pub struct KeepAlive;

#[async_trait]
impl Handler for KeepAlive {
    fn name(&self) -> &'static str {
        "keep_alive"
    }

    async fn handle(&self, _ctx: &mut HandlerContext<'_>, request: &Request) -> Result<()> {
        debug!(oc = %request.head.oc, org = %request.head.org, "keep alive");
        Ok(())
    }
}

/// Resolves a guest notification into a cache client.
pub struct GuestUpsert;

#[async_trait]
impl Handler for GuestUpsert {
    fn name(&self) -> &'static str {
        "guest_upsert"
    }

    async fn handle(&self, ctx: &mut HandlerContext<'_>, request: &Request) -> Result<()> {
        let RequestBody::Guest(rec) = &request.body else {
            return Err(wrong_shape(self, request));
        };
        let identity = ClientIdentity::from_record(rec)?;
        let resolution = ctx.resolver.resolve(ctx.conn, &identity).await?;
        info!(
            oc = %request.head.oc,
            ass_id = resolution.ass_id,
            created = resolution.created,
            discrepancies = resolution.discrepancies.len(),
            "guest processed"
        );
        Ok(())
    }
}

async fn resolve_guest(ctx: &mut HandlerContext<'_>, sh_id: Value) -> Result<Option<i64>> {
    if sh_id.is_empty() {
        return Ok(None);
    }
    let identity = ClientIdentity { sh_id: Some(sh_id.to_text()), ..Default::default() };
    Ok(Some(ctx.resolver.resolve(ctx.conn, &identity).await?.ass_id))
}

/// Stores a reservation notification and marks it dirty.
pub struct ResChange;

#[async_trait]
impl Handler for ResChange {
    fn name(&self) -> &'static str {
        "res_change"
    }

    async fn handle(&self, ctx: &mut HandlerContext<'_>, request: &Request) -> Result<()> {
        let RequestBody::Reservation(rec) = &request.body else {
            return Err(wrong_shape(self, request));
        };
        let key = ResKey::from_record(rec);
        let segment = rec.val(RES_MKT_SEGMENT);
        if ctx.skips_segment(segment.as_str()) {
            info!(key = %key, segment = %segment.to_text(), "reservation skipped for its market segment");
            return Ok(());
        }

        let mut rec = rec.clone();
        if let Some(ass_id) = resolve_guest(ctx, rec.val(RES_ORDERER_SH_ID)).await? {
            rec.set_val(RES_ORDERER_ASS_ID, ass_id);
        }
        let mut persons = rec.rooming(RES_PERSONS).to_vec();
        for person in persons.iter_mut() {
            if let Some(ass_id) = resolve_guest(ctx, person.val(PERS_SH_ID)).await? {
                person.set_val(PERS_ASS_ID, ass_id);
            }
        }
        set_rooming(&mut rec, persons);

        // header, occupants and dirty mark are stored together or not at all
        ctx.conn.begin().await?;
        let obj_id = rec.val(RES_OBJ_ID);
        let stored = match save_reservation(ctx.conn, &rec).await {
            Ok(_) => touch_reservation(ctx.conn, &key, obj_id.as_str(), ctx.clock.now()).await,
            Err(e) => Err(e),
        };
        let rgr_pk = match stored {
            Ok(rgr_pk) => {
                ctx.conn.commit().await?;
                rgr_pk
            }
            Err(e) => {
                ctx.conn.rollback().await?;
                return Err(e);
            }
        };
        info!(oc = %request.head.oc, key = %key, rgr_pk, "reservation stored");
        Ok(())
    }
}

/// Occupancy events of one notification. A room move with an old sub number checks out of
/// the old sub-reservation and into the new one; a room move of sub number 1 only changes
/// the room number; any other room move is ignored.
pub fn room_changes(oc: &str, notice: &RoomNotice, at: NaiveDateTime) -> Vec<RoomChange> {
    let key = |sub_id: Option<&String>| {
        let key = ResKey::new(
            notice.hotel_id.as_str(),
            notice.res_id.clone().unwrap_or_default(),
            sub_id.cloned().unwrap_or_default(),
        );
        match (&notice.res_id, &notice.gds_no) {
            (None, Some(gds_no)) => key.with_gds_no(gds_no.as_str()),
            _ => key,
        }
    };
    let change = |sub_id: Option<&String>, action: RoomAction, room_id: &Option<String>| RoomChange {
        key: key(sub_id),
        action,
        room_id: room_id.clone(),
        action_time: at,
    };

    match oc {
        "CI" => vec![change(notice.sub_id.as_ref(), RoomAction::CheckIn, &notice.room_id)],
        "CO" => vec![change(notice.sub_id.as_ref(), RoomAction::CheckOut, &notice.room_id)],
        "RM" => match (&notice.old_sub_id, notice.sub_id.as_deref()) {
            (Some(old_sub_id), _) => vec![
                change(Some(old_sub_id), RoomAction::CheckOut, &notice.old_room_id),
                change(notice.sub_id.as_ref(), RoomAction::CheckIn, &notice.room_id),
            ],
            (None, Some("1")) => vec![change(notice.sub_id.as_ref(), RoomAction::RoomNumber, &notice.room_id)],
            (None, _) => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Stores check-in, check-out and room-move events.
pub struct RoomChangeHandler;

#[async_trait]
impl Handler for RoomChangeHandler {
    fn name(&self) -> &'static str {
        "room_change"
    }

    async fn handle(&self, ctx: &mut HandlerContext<'_>, request: &Request) -> Result<()> {
        let RequestBody::RoomChange(notice) = &request.body else {
            return Err(wrong_shape(self, request));
        };
        if ctx.skips_segment(notice.mkt_segment.as_deref()) {
            info!(oc = %request.head.oc, segment = ?notice.mkt_segment, "room change skipped for its market segment");
            return Ok(());
        }
        let changes = room_changes(&request.head.oc, notice, ctx.clock.now());
        if changes.is_empty() {
            debug!(oc = %request.head.oc, sub_id = ?notice.sub_id, "room change ignored");
        }
        for change in &changes {
            let sf_id = apply_room_change(ctx.conn, change).await?;
            info!(key = %change.key, action = ?change.action, room = ?change.room_id, ?sf_id, "room change stored");
        }
        Ok(())
    }
}

/// Handlers addressable by name from the route table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<&'static str, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in handler.
    pub fn standard() -> Self {
        Self::new()
            .with(Arc::new(KeepAlive))
            .with(Arc::new(GuestUpsert))
            .with(Arc::new(ResChange))
            .with(Arc::new(RoomChangeHandler))
    }

    pub fn with(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(handler.name(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }
}
