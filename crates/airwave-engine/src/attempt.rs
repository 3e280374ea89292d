//! Terminal bookkeeping for load and recovery attempts.
//!
//! Every attempt the session starts is registered here under a fresh
//! [`AttemptId`]. Whoever settles it first (a ready signal, a failure signal, a
//! timeout, or a newer load) takes the pending entry; every later settle of the
//! same id is a no-op.

use std::collections::HashMap;
use std::time::Duration;

use airwave_core::Result;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::backend::{AttemptId, ReadyInfo};
use crate::transition::SlotId;

/// Why an attempt was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPurpose {
    /// A track or prefetch load awaited by a caller.
    Load,
    /// Proactive reload requested by the buffer governor.
    GovernorRecovery,
    /// Reload or reassignment requested by the stall ladder.
    StallRecovery,
}

impl AttemptPurpose {
    pub const fn is_recovery(self) -> bool {
        !matches!(self, Self::Load)
    }
}

/// An attempt that has not settled yet.
#[derive(Debug)]
pub struct PendingAttempt {
    pub slot: SlotId,
    pub purpose: AttemptPurpose,
    pub started: Instant,
    reply: Option<oneshot::Sender<Result<ReadyInfo>>>,
}

impl PendingAttempt {
    /// Deliver the outcome to the awaiting caller, if there is one.
    pub fn complete(self, outcome: Result<ReadyInfo>) {
        if let Some(reply) = self.reply {
            // The caller may have given up already.
            let _ = reply.send(outcome);
        }
    }
}

/// Registry of unsettled attempts.
#[derive(Debug, Default)]
pub struct AttemptTable {
    next: u64,
    pending: HashMap<AttemptId, PendingAttempt>,
}

impl AttemptTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> AttemptId {
        self.next += 1;
        AttemptId(self.next)
    }

    /// Register a load attempt and return the receiver its caller awaits.
    pub fn open_load(
        &mut self,
        slot: SlotId,
        now: Instant,
    ) -> (AttemptId, oneshot::Receiver<Result<ReadyInfo>>) {
        let id = self.allocate();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingAttempt {
                slot,
                purpose: AttemptPurpose::Load,
                started: now,
                reply: Some(tx),
            },
        );
        (id, rx)
    }

    /// Register a recovery attempt. Nobody awaits it; the session handles its
    /// outcome when the signal arrives or the attempt expires.
    pub fn open_recovery(&mut self, slot: SlotId, purpose: AttemptPurpose, now: Instant) -> AttemptId {
        let id = self.allocate();
        self.pending.insert(
            id,
            PendingAttempt {
                slot,
                purpose,
                started: now,
                reply: None,
            },
        );
        id
    }

    /// Take the pending entry. Returns `None` if the attempt already settled.
    pub fn settle(&mut self, id: AttemptId) -> Option<PendingAttempt> {
        self.pending.remove(&id)
    }

    /// Whether an attempt with this id was issued and has settled.
    pub fn is_settled(&self, id: AttemptId) -> bool {
        id.0 != 0 && id.0 <= self.next && !self.pending.contains_key(&id)
    }

    /// Settle every attempt targeting `slot`. Awaiting callers see their
    /// receiver close.
    pub fn abandon_slot(&mut self, slot: SlotId) -> Vec<(AttemptId, PendingAttempt)> {
        let ids: Vec<AttemptId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.slot == slot)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|p| (id, p)))
            .collect()
    }

    /// Settle recovery attempts older than `timeout`.
    pub fn expire_recoveries(
        &mut self,
        now: Instant,
        timeout: Duration,
    ) -> Vec<(AttemptId, PendingAttempt)> {
        let mut expired: Vec<AttemptId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.purpose.is_recovery() && now.duration_since(p.started) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|p| (id, p)))
            .collect()
    }

    /// Settle recovery attempts targeting `slot`, leaving its loads alone.
    pub fn abandon_recoveries(&mut self, slot: SlotId) -> Vec<(AttemptId, PendingAttempt)> {
        let ids: Vec<AttemptId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.slot == slot && p.purpose.is_recovery())
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|p| (id, p)))
            .collect()
    }

    pub fn has_pending_recovery(&self, slot: SlotId) -> bool {
        self.pending
            .values()
            .any(|p| p.slot == slot && p.purpose.is_recovery())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
