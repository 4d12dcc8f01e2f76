//! Provisional and authoritative sequence numbers for in-flight messages
//!
//! A message needs a position in the conversation before its completion
//! supplies the authoritative number. The tracker hands out provisional
//! numbers past everything already placed and remembers the authoritative
//! numbers as completions arrive.

use std::collections::HashMap;

use crate::message::DisplayId;

#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    provisional: HashMap<DisplayId, u64>,
    finals: HashMap<DisplayId, u64>,
    max_assigned: Option<u64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provisional number for a display id and whether this is its first
    /// sighting.
    ///
    /// `floor` is the lowest number the message may take, normally the
    /// conversation's message count. Numbers assigned by one tracker are
    /// strictly increasing.
    pub fn provisional_for(&mut self, display_id: &DisplayId, floor: u64) -> (u64, bool) {
        if let Some(seq) = self.provisional.get(display_id) {
            return (*seq, false);
        }
        let seq = match self.max_assigned {
            Some(max) => floor.max(max + 1),
            None => floor,
        };
        self.max_assigned = Some(seq);
        self.provisional.insert(display_id.clone(), seq);
        (seq, true)
    }

    /// Remember the authoritative number from a completion
    pub fn record_final(&mut self, display_id: &DisplayId, seq: u64) {
        self.finals.insert(display_id.clone(), seq);
    }

    /// Best known number: authoritative first, then provisional
    pub fn resolve(&self, display_id: &DisplayId) -> Option<u64> {
        self.finals
            .get(display_id)
            .copied()
            .or_else(|| self.provisional.get(display_id).copied())
    }

}
