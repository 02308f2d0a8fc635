//! Stream event domain type

use serde::{Deserialize, Serialize};

use super::result::SimResult;

/// Completion notification published by the streaming runner
///
/// Events arrive in completion order; `index` points back at the submitted
/// job so callers can rebuild submission order if they need it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Position of the originating job in the submitted list
    pub index: usize,
    pub label: String,
    pub result: SimResult,
    /// How many jobs have completed so far, this one included (1..=total)
    pub completed: usize,
    /// Number of jobs submitted
    pub total: usize,
}

impl StreamEvent {
    pub fn new(index: usize, result: SimResult, completed: usize, total: usize) -> Self {
        Self {
            index,
            label: result.label().to_string(),
            result,
            completed,
            total,
        }
    }

    /// True for the event completing the batch
    pub fn is_last(&self) -> bool {
        self.completed == self.total
    }

    /// Completed fraction in `0.0..=1.0`
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::result::FailureReason;
    use std::time::Duration;

    #[test]
    fn test_event_progress() {
        let result = SimResult::failed("b", "/b", FailureReason::Cancelled, Duration::ZERO);
        let event = StreamEvent::new(1, result, 2, 4);

        assert_eq!(event.label, "b");
        assert_eq!(event.progress(), 0.5);
        assert!(!event.is_last());
    }
}
