use std::collections::HashSet;
use std::sync::Arc;

use crate::RunObserver;

/// Run-wide flag set. Notifies the observer once per distinct value.
pub struct FlagAggregator {
    run_id: String,
    flags: Vec<String>,
    seen: HashSet<String>,
    observer: Arc<dyn RunObserver>,
}

impl FlagAggregator {
    pub fn new(run_id: impl Into<String>, observer: Arc<dyn RunObserver>) -> Self {
        Self {
            run_id: run_id.into(),
            flags: Vec::new(),
            seen: HashSet::new(),
            observer,
        }
    }

    /// Returns the values that were not already known.
    pub fn record<I, S>(&mut self, candidates: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut fresh = Vec::new();
        for candidate in candidates {
            let candidate = candidate.as_ref().trim();
            if candidate.is_empty() || self.seen.contains(candidate) {
                continue;
            }
            self.seen.insert(candidate.to_string());
            self.flags.push(candidate.to_string());
            self.observer.on_flag_found(&self.run_id, candidate);
            fresh.push(candidate.to_string());
        }
        fresh
    }

    pub fn has_any(&self) -> bool {
        !self.flags.is_empty()
    }

    /// Discovery order.
    pub fn flags(&self) -> &[String] {
        &self.flags
    }
}
