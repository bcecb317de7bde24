//! Remote candidate buffering relative to remote-description readiness.

use std::collections::VecDeque;

use duet_common::{IceCandidate, SignalingMessage};
use tracing::{debug, warn};

use crate::error::CallError;
use crate::peer::PeerConnection;
use crate::signaling::SignalingChannel;

/// Outcome of handing one remote candidate to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Buffered,
    Applied,
    /// Rejected by the media stack; logged and dropped.
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub skipped: usize,
}

/// Buffers remote candidates until the remote description exists.
///
/// The buffer is flushed once, in arrival order, right after the first
/// remote description is applied. From then on candidates go straight to
/// the peer connection for the rest of the session.
#[derive(Debug, Default)]
pub struct IceCoordinator {
    pending: VecDeque<IceCandidate>,
    flushed: bool,
    applied: usize,
    skipped: usize,
}

impl IceCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local candidates are sent as soon as the platform produces them.
    pub async fn add_local_candidate(
        &mut self,
        candidate: IceCandidate,
        signaling: &mut SignalingChannel,
    ) -> Result<u64, CallError> {
        signaling
            .publish(SignalingMessage::IceCandidate { candidate })
            .await
    }

    pub async fn receive_remote_candidate(
        &mut self,
        candidate: IceCandidate,
        peer: &mut dyn PeerConnection,
    ) -> CandidateDisposition {
        if !self.flushed {
            self.pending.push_back(candidate);
            debug!(buffered = self.pending.len(), "buffered remote candidate");
            return CandidateDisposition::Buffered;
        }
        self.apply(&candidate, peer).await
    }

    /// Apply everything buffered. Only the first call does any work.
    pub async fn flush(&mut self, peer: &mut dyn PeerConnection) -> FlushReport {
        let mut report = FlushReport::default();
        if self.flushed {
            return report;
        }
        self.flushed = true;

        while let Some(candidate) = self.pending.pop_front() {
            match self.apply(&candidate, peer).await {
                CandidateDisposition::Applied => report.applied += 1,
                _ => report.skipped += 1,
            }
        }
        debug!(applied = report.applied, skipped = report.skipped, "flushed remote candidates");
        report
    }

    async fn apply(
        &mut self,
        candidate: &IceCandidate,
        peer: &mut dyn PeerConnection,
    ) -> CandidateDisposition {
        match peer.add_ice_candidate(candidate).await {
            Ok(()) => {
                self.applied += 1;
                CandidateDisposition::Applied
            }
            Err(err) => {
                let err = CallError::candidate(err);
                warn!(candidate = %candidate.candidate, "skipping candidate: {}", err);
                self.skipped += 1;
                CandidateDisposition::Skipped
            }
        }
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn applied(&self) -> usize {
        self.applied
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Drop anything still buffered; used on teardown.
    pub fn discard(&mut self) {
        self.pending.clear();
    }
}
