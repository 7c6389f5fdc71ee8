//! Monotonic Merge Store
//!
//! Remembers the best-known status of every `(step, participant)` pair and
//! refuses to let a stale observation overwrite a fresher one. Polls race
//! with each other and with activity-log inference; the store guarantees the
//! status handed to the UI for a pair never moves down the rank table.

use std::collections::HashMap;

use log::debug;

use crate::flow::model::{email_key, ParticipantStepRecord};

/// What a merge did with the incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No record existed for the key
    Inserted,
    /// The incoming record replaced the cached one
    Replaced,
    /// The incoming record was older or lower-ranked and was dropped
    Discarded,
}

/// Per-(step, participant) memory that only moves forward.
#[derive(Debug, Clone, Default)]
pub struct MergeStore {
    records: HashMap<(String, String), ParticipantStepRecord>,
}

impl MergeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a record and returns the record now held for its key.
    ///
    /// A lower-ranked incoming record is discarded. An equal-ranked one
    /// replaces the cached record unless both carry report times and the
    /// incoming one is older. Either way a missing `output_dir` is filled
    /// from whichever record has one.
    pub fn merge(&mut self, incoming: ParticipantStepRecord) -> ParticipantStepRecord {
        let (record, _) = self.merge_with_outcome(incoming);
        record
    }

    /// Like [`MergeStore::merge`] but also reports what happened.
    pub fn merge_with_outcome(
        &mut self,
        incoming: ParticipantStepRecord,
    ) -> (ParticipantStepRecord, MergeOutcome) {
        let key = (incoming.step_id.clone(), email_key(&incoming.participant));

        let Some(cached) = self.records.get_mut(&key) else {
            self.records.insert(key, incoming.clone());
            return (incoming, MergeOutcome::Inserted);
        };

        let cached_rank = cached.status.rank();
        let incoming_rank = incoming.status.rank();

        let replace = if incoming_rank != cached_rank {
            incoming_rank > cached_rank
        } else {
            match (incoming.reported_at, cached.reported_at) {
                (Some(new), Some(old)) => new >= old,
                _ => true,
            }
        };

        if !replace {
            debug!(
                "Discarding stale status {} for {}/{} (holding {})",
                incoming.status, incoming.step_id, incoming.participant, cached.status
            );
            if cached.output_dir.is_none() && incoming_rank == cached_rank {
                cached.output_dir = incoming.output_dir;
            }
            return (cached.clone(), MergeOutcome::Discarded);
        }

        let output_dir = incoming.output_dir.clone().or_else(|| cached.output_dir.take());
        *cached = ParticipantStepRecord {
            output_dir,
            ..incoming
        };
        (cached.clone(), MergeOutcome::Replaced)
    }

    /// Returns the record held for a key.
    pub fn get(&self, step_id: &str, participant: &str) -> Option<&ParticipantStepRecord> {
        self.records
            .get(&(step_id.to_string(), email_key(participant)))
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing has been merged.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
