//! Gap-aware mapping from remote sequence tokens to local fake sequences.

use std::collections::{BTreeSet, VecDeque};

/// Assigns dense local sequences to remote sequence tokens and tracks which
/// have been fully processed.
///
/// Sequences are handed out from 1 in the order values are added. Removing a
/// sequence marks it processed; [`SequenceMap::checkpointed_value`] is the
/// token of the highest sequence below which nothing is still pending, so a
/// checkpoint built from it never skips unfinished work.
#[derive(Debug, Clone)]
pub struct SequenceMap {
    pending: BTreeSet<u64>,
    last_sequence: u64,
    values: VecDeque<String>,
    first_value_sequence: u64,
}

impl SequenceMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            pending: BTreeSet::new(),
            last_sequence: 0,
            values: VecDeque::new(),
            first_value_sequence: 1,
        }
    }

    /// Adds a value and returns the sequence assigned to it.
    pub fn add_value(&mut self, value: impl Into<String>) -> u64 {
        self.last_sequence += 1;
        self.pending.insert(self.last_sequence);
        self.values.push_back(value.into());
        self.last_sequence
    }

    /// Marks a sequence as processed.
    pub fn remove_sequence(&mut self, sequence: u64) {
        self.pending.remove(&sequence);
        self.discard_unreachable_values();
    }

    /// Returns true if no sequence is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of pending sequences.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Highest sequence such that it and every sequence below it are processed.
    pub fn checkpointed_sequence(&self) -> u64 {
        match self.pending.first() {
            Some(first_pending) => first_pending - 1,
            None => self.last_sequence,
        }
    }

    /// Value of [`SequenceMap::checkpointed_sequence`], if any sequence is processed.
    pub fn checkpointed_value(&self) -> Option<&str> {
        let sequence = self.checkpointed_sequence();
        if sequence < self.first_value_sequence {
            return None;
        }
        let index = usize::try_from(sequence - self.first_value_sequence).ok()?;
        self.values.get(index).map(String::as_str)
    }

    fn discard_unreachable_values(&mut self) {
        // keep the checkpointed value itself
        let checkpointed = self.checkpointed_sequence();
        while self.first_value_sequence < checkpointed && !self.values.is_empty() {
            self.values.pop_front();
            self.first_value_sequence += 1;
        }
    }
}

impl Default for SequenceMap {
    fn default() -> Self {
        Self::new()
    }
}
