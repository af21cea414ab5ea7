//! Durable request/job ledger
//!
//! Request states: PENDING → {COMPLETED | FAILED}, written exactly once
//! by the scheduler.
//! Job states: WAITING → RUNNING → {COMPLETED | FAILED} with CLEANINGUP
//! as the intermediate state of a cancelled run.
//!
//! The relational store itself is out of scope: the crate consumes it
//! through the [`Ledger`] trait and ships [`MemoryLedger`] for embedding
//! and tests. Requests are written in two phases — a staged row has an id
//! but is not externally readable until committed — so that a secret
//! bundle can be keyed off an id that never becomes visible if the write
//! is abandoned.

mod memory;

pub use memory::MemoryLedger;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a request row
pub type RequestId = Uuid;

/// Identifier of a job row
pub type JobId = Uuid;

/// Global submission sequence for queue ordering within one process
static SUBMIT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Next submission sequence number
pub fn next_submit_seq() -> u64 {
    SUBMIT_SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

/// What a request asks the system to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    /// Create and run a new job
    Submit,
    /// Cancel an existing job
    Cancel,
}

/// Request lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    /// Awaiting scheduler admission
    Pending,
    /// Admission finished successfully
    Completed,
    /// Admission was rejected or the action could not be carried out
    Failed,
}

impl RequestState {
    /// Returns true if the request will never change state again
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed)
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Admitted, waiting in a queue or delayed set
    Waiting,
    /// Actively executing on a machine
    Running,
    /// Cancellation signalled, run winding down
    #[serde(rename = "CLEANINGUP")]
    CleaningUp,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully (including cancelled runs)
    Failed,
}

impl JobState {
    /// Returns true if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Check whether a transition from this state to `target` is valid
    pub fn can_transition_to(&self, target: JobState) -> bool {
        match (self, target) {
            // From WAITING
            (JobState::Waiting, JobState::Running) => true,
            (JobState::Waiting, JobState::Failed) => true, // cancelled before start

            // From RUNNING
            (JobState::Running, JobState::CleaningUp) => true,
            (JobState::Running, JobState::Completed) => true,
            (JobState::Running, JobState::Failed) => true,

            // From CLEANINGUP
            (JobState::CleaningUp, JobState::Completed) => true, // finished before cancel took effect
            (JobState::CleaningUp, JobState::Failed) => true,

            // Terminal states never transition
            _ => false,
        }
    }
}

/// Named queue partition a job is assigned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeSlot {
    /// General-purpose queue
    #[default]
    Default,
    /// Low-contention hours
    OffPeak,
    /// Maintenance window work
    Maintenance,
}

impl TimeSlot {
    /// Queue name used in snapshots
    pub fn name(&self) -> &'static str {
        match self {
            TimeSlot::Default => "default",
            TimeSlot::OffPeak => "off_peak",
            TimeSlot::Maintenance => "maintenance",
        }
    }
}

/// A client-issued intent to submit or cancel a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRow {
    /// Request identifier
    pub id: RequestId,
    /// SUBMIT or CANCEL
    pub action_type: ActionType,
    /// Execution machine type; set iff SUBMIT
    pub job_type: String,
    /// Target job for CANCEL; filled by the scheduler for SUBMIT once admitted
    pub job_id: Option<JobId>,
    /// Authenticated caller that issued the request
    pub requester: String,
    /// Opaque (already prefiltered) parameter payload
    pub parameters: serde_json::Value,
    /// Queue priority, higher runs first
    pub priority: i32,
    /// Queue partition
    pub time_slot: TimeSlot,
    /// Run budget in seconds, 0 = unbounded
    pub timeout: u64,
    /// Earliest time the job may start
    pub start_date: Option<DateTime<Utc>>,
    /// Set at creation, immutable
    pub submit_date: DateTime<Utc>,
    /// Lifecycle state, written exactly once by the scheduler
    pub state: RequestState,
    /// Human-readable outcome, set together with the terminal state
    pub result: Option<String>,
}

/// A tracked unit of asynchronous work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    /// Job identifier
    pub id: JobId,
    /// Execution machine type
    pub job_type: String,
    /// Caller the job runs on behalf of
    pub requester: String,
    /// Queue priority
    pub priority: i32,
    /// Queue partition
    pub time_slot: TimeSlot,
    /// Lifecycle state
    pub state: JobState,
    /// Opaque descriptor of the resources claimed at admission
    pub resources: serde_json::Value,
    /// Prefiltered parameter payload
    pub parameters: serde_json::Value,
    /// Human-readable description
    pub description: String,
    /// When the request that created this job was submitted
    pub submit_date: DateTime<Utc>,
    /// Set when the job first leaves WAITING
    pub start_date: Option<DateTime<Utc>>,
    /// Set iff the job is terminal
    pub end_date: Option<DateTime<Utc>>,
    /// Outcome text, set on COMPLETED/FAILED
    pub result: Option<String>,
    /// Run budget in seconds, 0 = unbounded
    pub timeout: u64,
    /// Submission sequence for FIFO ordering among equal priorities
    pub submit_seq: u64,
}

impl JobRow {
    /// Transition to `target`, maintaining the date invariants:
    /// `start_date` is set when the job first leaves WAITING and
    /// `end_date` is set iff the target is terminal.
    pub fn transition(&mut self, target: JobState, at: DateTime<Utc>) -> Result<(), LedgerError> {
        if !self.state.can_transition_to(target) {
            return Err(LedgerError::InvalidTransition {
                from: self.state,
                to: target,
            });
        }
        if self.state == JobState::Waiting && self.start_date.is_none() && target != JobState::Failed
        {
            self.start_date = Some(at);
        }
        if target.is_terminal() {
            self.end_date = Some(at);
        }
        self.state = target;
        Ok(())
    }

    /// WAITING → RUNNING
    pub fn start(&mut self, at: DateTime<Utc>) -> Result<(), LedgerError> {
        self.transition(JobState::Running, at)
    }

    /// Finish with a terminal state and result text
    pub fn finish(
        &mut self,
        state: JobState,
        result: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.transition(state, at)?;
        self.result = Some(result.into());
        Ok(())
    }
}

/// Ledger storage errors
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("no such row: {0}")]
    NotFound(Uuid),

    #[error("invalid job transition from {from:?} to {to:?}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("request {0} already reached a terminal state")]
    AlreadyFinal(RequestId),

    #[error("storage fault: {0}")]
    Storage(String),
}

impl From<LedgerError> for crate::error::Error {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(id) => crate::error::Error::NotFound(id.to_string()),
            other => crate::error::Error::Ledger(other.to_string()),
        }
    }
}

/// Ordered request/job ledger
///
/// Single-writer from the scheduler's side, multi-reader for everyone
/// else. Implementations must make each method atomic.
pub trait Ledger: Send + Sync {
    /// Write a request row without making it visible; returns its id
    fn stage_request(&self, row: RequestRow) -> Result<RequestId, LedgerError>;

    /// Make a previously staged request externally visible
    fn commit_request(&self, id: RequestId) -> Result<(), LedgerError>;

    /// Drop a staged request as if it had never been written
    fn discard_request(&self, id: RequestId) -> Result<(), LedgerError>;

    /// Read a committed request
    fn get_request(&self, id: RequestId) -> Result<Option<RequestRow>, LedgerError>;

    /// Committed requests still awaiting admission, oldest first
    fn pending_requests(&self) -> Result<Vec<RequestRow>, LedgerError>;

    /// Write the terminal state of a request, exactly once, optionally
    /// linking the admitted job
    fn finish_request(
        &self,
        id: RequestId,
        state: RequestState,
        result: &str,
        job_id: Option<JobId>,
    ) -> Result<(), LedgerError>;

    /// Insert a freshly admitted job row
    fn insert_job(&self, row: JobRow) -> Result<(), LedgerError>;

    /// Replace a job row (scheduler-only write path)
    fn put_job(&self, row: JobRow) -> Result<(), LedgerError>;

    /// Read a job row
    fn get_job(&self, id: JobId) -> Result<Option<JobRow>, LedgerError>;

    /// Snapshot of every job in the given state, submission order
    fn jobs_in_state(&self, state: JobState) -> Result<Vec<JobRow>, LedgerError>;
}

/// Secret variables extracted from a submission, keyed by variable name
pub type SecretVars = BTreeMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobRow {
        JobRow {
            id: Uuid::new_v4(),
            job_type: "echo".into(),
            requester: "alice".into(),
            priority: 0,
            time_slot: TimeSlot::Default,
            state: JobState::Waiting,
            resources: serde_json::Value::Null,
            parameters: serde_json::Value::Null,
            description: String::new(),
            submit_date: Utc::now(),
            start_date: None,
            end_date: None,
            result: None,
            timeout: 0,
            submit_seq: next_submit_seq(),
        }
    }

    #[test]
    fn test_start_sets_start_date_once() {
        let mut row = job();
        let t0 = Utc::now();
        row.start(t0).unwrap();
        assert_eq!(row.state, JobState::Running);
        assert_eq!(row.start_date, Some(t0));
        assert!(row.end_date.is_none());
    }

    #[test]
    fn test_finish_sets_end_date_iff_terminal() {
        let mut row = job();
        row.start(Utc::now()).unwrap();
        row.transition(JobState::CleaningUp, Utc::now()).unwrap();
        assert!(row.end_date.is_none(), "CLEANINGUP is not terminal");
        row.finish(JobState::Failed, "cancelled", Utc::now()).unwrap();
        assert!(row.end_date.is_some());
        assert_eq!(row.result.as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_cancelled_before_start_never_gets_start_date() {
        let mut row = job();
        row.finish(JobState::Failed, "cancelled before start", Utc::now())
            .unwrap();
        assert!(row.start_date.is_none());
        assert!(row.end_date.is_some());
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut row = job();
        row.start(Utc::now()).unwrap();
        row.finish(JobState::Completed, "done", Utc::now()).unwrap();
        let err = row.transition(JobState::Running, Utc::now()).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[test]
    fn test_job_state_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&JobState::CleaningUp).unwrap(),
            "\"CLEANINGUP\""
        );
        assert_eq!(
            serde_json::to_string(&RequestState::Pending).unwrap(),
            "\"PENDING\""
        );
    }
}
