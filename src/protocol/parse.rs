//! Tolerant scanning of hotel system XML notifications.
//!
//! Senders are known to emit documents that are not strictly well-formed, so nothing here
//! builds a DOM: leaf elements (`<TAG>text</TAG>`) are found with a regex and nested blocks
//! are cut out by plain tag search.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cache::clients::client_record;
use crate::cache::reservations::{occupant_record, reservation_record, set_rooming};
use crate::core::{ColumnValues, Result, SyncError, Value};
use crate::fields::{Record, System};

lazy_static! {
    static ref LEAF: Regex =
        Regex::new(r"<([A-Za-z][\w.-]*)(?:\s[^<>]*)?>([^<]*)</([A-Za-z][\w.-]*)\s*>").expect("leaf pattern");
}

/// Transaction number echoed when a request carries none.
pub const DEFAULT_TN: &str = "0";

/// Tag of one occupant block inside a reservation notification.
pub const PERSON_TAG: &str = "PERSON";

/// Replaces the predefined XML entities.
pub fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// All leaf elements of `doc` in document order, values unescaped and trimmed.
/// Pairs whose closing tag does not match the opening one are skipped.
pub fn leaves(doc: &str) -> Vec<(String, String)> {
    LEAF.captures_iter(doc)
        .filter(|caps| caps[1] == caps[3])
        .map(|caps| (caps[1].to_string(), unescape(caps[2].trim())))
        .collect()
}

/// First non-empty value of the leaf `tag`.
pub fn scan_value(doc: &str, tag: &str) -> Option<String> {
    leaves(doc).into_iter().find(|(name, value)| name == tag && !value.is_empty()).map(|(_, value)| value)
}

fn open_tag_at(doc: &str, tag: &str, from: usize) -> Option<(usize, usize)> {
    let mut pos = from;
    while let Some(found) = doc[pos..].find(&format!("<{}", tag)) {
        let start = pos + found;
        let after = start + tag.len() + 1;
        match doc[after..].chars().next() {
            Some('>') => return Some((start, after + 1)),
            Some(c) if c.is_whitespace() => {
                let end = doc[after..].find('>').map(|i| after + i + 1)?;
                return Some((start, end));
            }
            _ => pos = after,
        }
    }
    None
}

/// Byte ranges `(outer_start, inner_start, inner_end, outer_end)` of every `tag` block.
fn block_ranges(doc: &str, tag: &str) -> Vec<(usize, usize, usize, usize)> {
    let close = format!("</{}>", tag);
    let mut ranges = Vec::new();
    let mut pos = 0;
    while let Some((start, inner)) = open_tag_at(doc, tag, pos) {
        let Some(found) = doc[inner..].find(&close) else { break };
        let inner_end = inner + found;
        let end = inner_end + close.len();
        ranges.push((start, inner, inner_end, end));
        pos = end;
    }
    ranges
}

/// Inner text of every `tag` block.
pub fn blocks<'d>(doc: &'d str, tag: &str) -> Vec<&'d str> {
    block_ranges(doc, tag).into_iter().map(|(_, inner, inner_end, _)| &doc[inner..inner_end]).collect()
}

/// `doc` with all `tag` blocks cut out.
pub fn without_blocks(doc: &str, tag: &str) -> String {
    let mut out = String::with_capacity(doc.len());
    let mut pos = 0;
    for (start, _, _, end) in block_ranges(doc, tag) {
        out.push_str(&doc[pos..start]);
        pos = end;
    }
    out.push_str(&doc[pos..]);
    out
}

/// Leaf values keyed by tag; the first occurrence of a tag wins.
fn leaf_map(doc: &str) -> ColumnValues {
    let mut values = ColumnValues::new();
    for (name, value) in leaves(doc) {
        values.entry(name).or_insert_with(|| Value::from(value.as_str()).normalized());
    }
    values
}

/// Operation code, transaction number and organization of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub oc: String,
    pub tn: String,
    pub org: String,
}

impl RequestHead {
    /// Never fails; absent elements become empty (or [`DEFAULT_TN`]).
    pub fn parse(doc: &str) -> Self {
        let head = leaf_map(&without_blocks(doc, PERSON_TAG));
        let text = |tag: &str| head.get(tag).map(Value::to_text).unwrap_or_default();
        let tn = text("TN");
        Self {
            oc: text("OC"),
            tn: if tn.is_empty() { DEFAULT_TN.to_string() } else { tn },
            org: text("ORG"),
        }
    }
}

/// How the body of a request is interpreted before the handlers see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestShape {
    /// Only the head is used.
    Basic,
    /// A guest (client) notification.
    Guest,
    /// A reservation notification with its occupant blocks.
    Reservation,
    /// A check-in, check-out or room-move notification.
    RoomChange,
}

impl fmt::Display for RequestShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestShape::Basic => "basic",
            RequestShape::Guest => "guest",
            RequestShape::Reservation => "reservation",
            RequestShape::RoomChange => "room_change",
        };
        f.write_str(name)
    }
}

/// Fields of an occupancy notification (`CI`, `CO`, `RM`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomNotice {
    pub hotel_id: String,
    pub res_id: Option<String>,
    pub sub_id: Option<String>,
    /// Sub number before a room move (`OSUB-NR`).
    pub old_sub_id: Option<String>,
    pub gds_no: Option<String>,
    pub room_id: Option<String>,
    /// Room number before a room move (`ORN`).
    pub old_room_id: Option<String>,
    pub guest_id: Option<String>,
    pub mkt_segment: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Basic,
    Guest(Record),
    Reservation(Record),
    RoomChange(RoomNotice),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub head: RequestHead,
    pub shape: RequestShape,
    pub body: RequestBody,
}

impl Request {
    pub fn parse(doc: &str, shape: RequestShape) -> Result<Self> {
        let head = RequestHead::parse(doc);
        let body = match shape {
            RequestShape::Basic => RequestBody::Basic,
            RequestShape::Guest => RequestBody::Guest(parse_guest(doc)),
            RequestShape::Reservation => RequestBody::Reservation(parse_reservation(doc)?),
            RequestShape::RoomChange => RequestBody::RoomChange(parse_room_notice(doc)?),
        };
        Ok(Self { head, shape, body })
    }
}

fn parse_guest(doc: &str) -> Record {
    let mut rec = client_record();
    rec.set_system_values(System::Sh, &leaf_map(doc));
    rec.pull(System::Sh);
    rec
}

fn parse_reservation(doc: &str) -> Result<Record> {
    let header = leaf_map(&without_blocks(doc, PERSON_TAG));
    if header.get("HN").is_none_or(Value::is_empty) {
        return Err(SyncError::Protocol("reservation notification without hotel number (HN)".into()));
    }
    let mut rec = reservation_record();
    rec.set_system_values(System::Sh, &header);

    let persons = blocks(doc, PERSON_TAG)
        .into_iter()
        .map(|block| {
            let mut occupant = occupant_record();
            occupant.set_system_values(System::Sh, &leaf_map(block));
            occupant
        })
        .collect();
    set_rooming(&mut rec, persons);
    rec.pull(System::Sh);
    Ok(rec)
}

fn parse_room_notice(doc: &str) -> Result<RoomNotice> {
    let values = leaf_map(&without_blocks(doc, PERSON_TAG));
    let text = |tag: &str| values.get(tag).filter(|v| !v.is_empty()).map(Value::to_text);
    let hotel_id = text("HN")
        .ok_or_else(|| SyncError::Protocol("room change notification without hotel number (HN)".into()))?;
    Ok(RoomNotice {
        hotel_id,
        res_id: text("RES-NR"),
        sub_id: text("SUB-NR"),
        old_sub_id: text("OSUB-NR"),
        gds_no: text("GDSNO"),
        room_id: text("RN"),
        old_room_id: text("ORN"),
        guest_id: text("GID"),
        mkt_segment: text("MC"),
    })
}
