//! Tracks consecutive failures per story and signals warnings.
//!
//! Grounded on the teacher's failure-policy shape (a small struct carrying
//! a threshold rather than an inline constant, with per-occurrence state
//! tracked alongside it) but simplified to the single counter the core
//! actually needs: stateful across a run, never persisted.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationStatus {
    Success,
    Failure,
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverbakeEvent {
    pub consecutive_failures: u32,
    pub threshold: u32,
    pub overbaked: bool,
    pub should_warn: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct StoryState {
    consecutive_failures: u32,
    warned: bool,
}

pub struct OverbakingDetector {
    threshold: u32,
    per_story: HashMap<String, StoryState>,
}

impl OverbakingDetector {
    /// Constructs a detector with threshold `T ≥ 1` (default 3). Invalid
    /// thresholds fail construction.
    pub fn new(threshold: u32) -> Result<Self, String> {
        if threshold < 1 {
            return Err(format!("overbake threshold must be >= 1, got {threshold}"));
        }
        Ok(Self {
            threshold,
            per_story: HashMap::new(),
        })
    }

    pub fn record(&mut self, story_id: &str, status: IterationStatus) -> OverbakeEvent {
        let state = self.per_story.entry(story_id.to_string()).or_default();

        if status != IterationStatus::Failure {
            state.consecutive_failures = 0;
            state.warned = false;
            return OverbakeEvent {
                consecutive_failures: 0,
                threshold: self.threshold,
                overbaked: false,
                should_warn: false,
            };
        }

        state.consecutive_failures += 1;
        let overbaked = state.consecutive_failures >= self.threshold;
        let should_warn = overbaked && !state.warned;
        if should_warn {
            state.warned = true;
        }

        OverbakeEvent {
            consecutive_failures: state.consecutive_failures,
            threshold: self.threshold,
            overbaked,
            should_warn,
        }
    }
}
