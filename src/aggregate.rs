//! Turn aggregation
//!
//! Transcript fragments for the current human turn accumulate here until the
//! turn is dispatched to the response generator, when the end-of-turn
//! detector fires with a non-empty filtered buffer.

use smallvec::SmallVec;

/// Accumulates transcript fragments into one candidate utterance.
#[derive(Default)]
pub struct TurnAggregator {
    fragments: SmallVec<[String; 4]>,
}

impl TurnAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: String) {
        let fragment = fragment.trim().to_string();
        if !fragment.is_empty() {
            self.fragments.push(fragment);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Atomically capture and clear, so fragments arriving afterwards start
    /// a fresh turn.
    pub fn take(&mut self) -> String {
        let fragments = std::mem::take(&mut self.fragments);
        fragments.join(" ")
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
    }
}
