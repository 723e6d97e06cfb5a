use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::cache::ResKey;
use crate::core::Result;
use crate::fields::{Record, System};

/// What a translated record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Reservation,
    RoomChange,
}

/// Key a downstream system is asked to fetch by.
#[derive(Debug, Clone, PartialEq)]
pub enum Identity {
    Reservation(ResKey),
}

/// An external system of record.
///
/// `upsert` receives a record whose values were pushed onto [`Downstream::system`] and
/// returns the external id of the written entity, if the system reports one. `fetch`
/// returns a record holding canonical values.
#[async_trait]
pub trait Downstream: Send + Sync {
    fn system(&self) -> System;

    async fn upsert(&self, kind: RecordKind, rec: &Record) -> Result<Option<String>>;

    async fn fetch(&self, identity: &Identity) -> Result<Record>;
}

/// Downstream systems used by a sync pass. Without a hotel system the cached reservation
/// is pushed as is.
#[derive(Clone)]
pub struct Downstreams {
    pub hotel: Option<Arc<dyn Downstream>>,
    pub crm: Arc<dyn Downstream>,
}

impl Downstreams {
    pub fn new(crm: Arc<dyn Downstream>) -> Self {
        Self { hotel: None, crm }
    }

    pub fn with_hotel(mut self, hotel: Arc<dyn Downstream>) -> Self {
        self.hotel = Some(hotel);
        self
    }
}
