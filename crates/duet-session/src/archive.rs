//! Hand-off of call metadata and chat to an external store.
//!
//! Writes happen on detached tasks. A slow or failing store never delays
//! or fails the call; errors are logged and dropped.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duet_common::{ChatMessage, Participant, RemotePeer, SessionId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallOutcome {
    /// We hung up.
    Completed,
    RemoteHangup,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub session: SessionId,
    pub local: Participant,
    pub remote: Option<RemotePeer>,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub outcome: CallOutcome,
}

impl CallRecord {
    /// Time spent connected, if the call ever connected.
    pub fn connected_duration(&self) -> Option<chrono::Duration> {
        self.connected_at.map(|at| self.ended_at - at)
    }
}

#[async_trait]
pub trait SessionArchive: Send + Sync + 'static {
    async fn store_call(&self, record: CallRecord) -> Result<()>;
    async fn store_chat(&self, message: ChatMessage) -> Result<()>;
}

pub(crate) fn hand_off_call(archive: Option<&Arc<dyn SessionArchive>>, record: CallRecord) {
    let Some(archive) = archive.cloned() else {
        return;
    };
    tokio::spawn(async move {
        let session = record.session.clone();
        match archive.store_call(record).await {
            Ok(()) => debug!(%session, "call record archived"),
            Err(err) => warn!(%session, "failed to archive call record: {:#}", err),
        }
    });
}

pub(crate) fn hand_off_chat(archive: Option<&Arc<dyn SessionArchive>>, message: ChatMessage) {
    let Some(archive) = archive.cloned() else {
        return;
    };
    tokio::spawn(async move {
        let session = message.session.clone();
        if let Err(err) = archive.store_chat(message).await {
            warn!(%session, "failed to archive chat message: {:#}", err);
        }
    });
}
