//! Per-request phase state machine.

use serde::{Deserialize, Serialize};
use sift_core::{AppError, AppResult};
use std::collections::BTreeMap;
use std::time::Instant;

/// Where a request is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Start,
    Analyzing,
    Retrieving,
    Assembling,
    Generating,
    Postprocessing,
    Done,
    Error,
}

impl PipelineStatus {
    /// Phase number (1-5) of a working state.
    pub fn phase(&self) -> Option<u8> {
        match self {
            Self::Analyzing => Some(1),
            Self::Retrieving => Some(2),
            Self::Assembling => Some(3),
            Self::Generating => Some(4),
            Self::Postprocessing => Some(5),
            _ => None,
        }
    }

    /// The only state reachable by advancing from this one.
    pub fn successor(&self) -> Option<Self> {
        match self {
            Self::Start => Some(Self::Analyzing),
            Self::Analyzing => Some(Self::Retrieving),
            Self::Retrieving => Some(Self::Assembling),
            Self::Assembling => Some(Self::Generating),
            Self::Generating => Some(Self::Postprocessing),
            Self::Postprocessing => Some(Self::Done),
            Self::Done | Self::Error => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// State of one request. Owned by the orchestrator and dropped with it.
#[derive(Debug)]
pub struct PipelineState {
    pub request_id: String,
    status: PipelineStatus,
    started: Option<(u8, Instant)>,
    timings: BTreeMap<u8, f64>,
    pub warnings: Vec<String>,
}

impl PipelineState {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: PipelineStatus::Start,
            started: None,
            timings: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    pub fn status(&self) -> PipelineStatus {
        self.status
    }

    /// Phase currently running, if any.
    pub fn current_phase(&self) -> Option<u8> {
        self.status.phase()
    }

    /// Advance to `next`, closing the timing of the current phase.
    ///
    /// Only the direct successor is accepted, so a completed phase can never
    /// be re-entered.
    pub fn enter(&mut self, next: PipelineStatus) -> AppResult<()> {
        if next == PipelineStatus::Error || self.status.successor() != Some(next) {
            return Err(AppError::Other(format!(
                "invalid pipeline transition {:?} -> {:?}",
                self.status, next
            )));
        }
        self.close_timing();
        self.status = next;
        if let Some(phase) = next.phase() {
            self.started = Some((phase, Instant::now()));
        }
        tracing::debug!(request_id = %self.request_id, status = ?next, "pipeline transition");
        Ok(())
    }

    /// Move to `Done`. Only valid from post-processing.
    pub fn finish(&mut self) -> AppResult<()> {
        self.enter(PipelineStatus::Done)
    }

    /// Absorb into `Error` from any non-terminal state and return the
    /// timings recorded so far, including the failed phase.
    pub fn fail(&mut self) -> BTreeMap<u8, f64> {
        if !self.status.is_terminal() {
            self.close_timing();
            self.status = PipelineStatus::Error;
        }
        self.timings.clone()
    }

    /// Wall-clock seconds per finished phase.
    pub fn timings(&self) -> &BTreeMap<u8, f64> {
        &self.timings
    }

    fn close_timing(&mut self) {
        if let Some((phase, started)) = self.started.take() {
            self.timings.insert(phase, started.elapsed().as_secs_f64());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER: [PipelineStatus; 6] = [
        PipelineStatus::Analyzing,
        PipelineStatus::Retrieving,
        PipelineStatus::Assembling,
        PipelineStatus::Generating,
        PipelineStatus::Postprocessing,
        PipelineStatus::Done,
    ];

    #[test]
    fn test_happy_path_records_every_phase() {
        let mut state = PipelineState::new("r1");
        for next in ORDER {
            state.enter(next).unwrap();
        }
        assert_eq!(state.status(), PipelineStatus::Done);
        assert_eq!(state.timings().keys().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
        assert!(state.timings().values().all(|t| *t >= 0.0));
    }

    #[test]
    fn test_skipping_or_reentering_is_rejected() {
        let mut state = PipelineState::new("r1");
        assert!(state.enter(PipelineStatus::Retrieving).is_err());

        state.enter(PipelineStatus::Analyzing).unwrap();
        state.enter(PipelineStatus::Retrieving).unwrap();
        assert!(state.enter(PipelineStatus::Analyzing).is_err());
        assert!(state.enter(PipelineStatus::Retrieving).is_err());
        assert_eq!(state.status(), PipelineStatus::Retrieving);
    }

    #[test]
    fn test_fail_is_absorbing_and_keeps_partial_timings() {
        let mut state = PipelineState::new("r1");
        state.enter(PipelineStatus::Analyzing).unwrap();
        state.enter(PipelineStatus::Retrieving).unwrap();

        let timings = state.fail();
        assert_eq!(timings.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(state.status(), PipelineStatus::Error);
        assert!(state.enter(PipelineStatus::Assembling).is_err());
        assert!(state.finish().is_err());
    }

    #[test]
    fn test_fail_before_any_phase_has_no_timings() {
        let mut state = PipelineState::new("r1");
        assert!(state.fail().is_empty());
        assert_eq!(state.current_phase(), None);
    }

    #[test]
    fn test_done_is_terminal() {
        let mut state = PipelineState::new("r1");
        for next in ORDER {
            state.enter(next).unwrap();
        }
        let before = state.timings().clone();
        assert_eq!(state.fail(), before);
        assert_eq!(state.status(), PipelineStatus::Done);
    }
}
