//! Job request gateway
//!
//! Front door for submissions and cancellations. Validates the request
//! shape, runs the target machine's prefilter to split secrets from
//! persistable parameters, and writes the ledger row and the secret
//! bundle as one choreographed unit:
//!
//! 1. stage the request row (it has an id but is not yet visible)
//! 2. store the secret bundle in the mediator under that id
//! 3. commit the ledger write
//!
//! A mediator failure aborts step 3 and discards the staged row, so no
//! request ever becomes visible with a silently missing secret bundle. A
//! commit failure leaves no externally visible secret because the bundle
//! key derives from an id that never became visible.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ledger::{
    ActionType, JobId, Ledger, RequestId, RequestRow, RequestState, TimeSlot,
};
use crate::machine::MachineRegistry;
use crate::mediator::{secret_key, Mediator, Value as CacheValue};

/// Base secret lifetime: one day
pub const SECRET_TTL_BASE_SECONDS: u64 = 86_400;

/// A client-side request, before validation
#[derive(Debug, Clone)]
pub struct NewRequest {
    /// SUBMIT or CANCEL
    pub action_type: ActionType,
    /// Execution machine type; required iff SUBMIT
    pub job_type: String,
    /// Target job; required iff CANCEL
    pub job_id: Option<JobId>,
    /// Authenticated caller
    pub requester: String,
    /// Raw, unparsed parameters
    pub parameters: Value,
    /// Queue priority
    pub priority: i32,
    /// Queue partition
    pub time_slot: TimeSlot,
    /// Run budget in seconds, 0 = unbounded
    pub timeout: u64,
    /// Earliest start time
    pub start_date: Option<DateTime<Utc>>,
}

impl NewRequest {
    /// A SUBMIT request with defaults for everything optional
    pub fn submit(job_type: impl Into<String>, requester: impl Into<String>, parameters: Value) -> Self {
        Self {
            action_type: ActionType::Submit,
            job_type: job_type.into(),
            job_id: None,
            requester: requester.into(),
            parameters,
            priority: 0,
            time_slot: TimeSlot::default(),
            timeout: 0,
            start_date: None,
        }
    }

    /// A CANCEL request for `job_id`
    pub fn cancel(job_id: JobId, requester: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::Cancel,
            job_type: String::new(),
            job_id: Some(job_id),
            requester: requester.into(),
            parameters: Value::Null,
            priority: 0,
            time_slot: TimeSlot::default(),
            timeout: 0,
            start_date: None,
        }
    }

    /// Set the queue priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the queue partition
    pub fn with_time_slot(mut self, time_slot: TimeSlot) -> Self {
        self.time_slot = time_slot;
        self
    }

    /// Set the run budget
    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delay the start until `start_date`
    pub fn with_start_date(mut self, start_date: DateTime<Utc>) -> Self {
        self.start_date = Some(start_date);
        self
    }
}

/// Secret bundle lifetime: one day plus however long the job will sit
/// waiting for a delayed start, so secrets outlive the wait
pub fn secret_ttl(submit_date: DateTime<Utc>, start_date: Option<DateTime<Utc>>) -> u64 {
    let delay = start_date
        .map(|start| (start - submit_date).num_seconds().max(0) as u64)
        .unwrap_or(0);
    SECRET_TTL_BASE_SECONDS + delay
}

/// Validated entry point for submissions and cancellations
pub struct Gateway {
    ledger: Arc<dyn Ledger>,
    mediator: Arc<Mediator>,
    machines: Arc<MachineRegistry>,
}

impl Gateway {
    /// Create a gateway over the given services
    pub fn new(
        ledger: Arc<dyn Ledger>,
        mediator: Arc<Mediator>,
        machines: Arc<MachineRegistry>,
    ) -> Self {
        Self {
            ledger,
            mediator,
            machines,
        }
    }

    /// Validate and persist a request; returns its id once the ledger
    /// write is committed. The request is then picked up asynchronously
    /// by the scheduler.
    pub fn submit(&self, request: NewRequest) -> Result<RequestId> {
        let (parameters, secrets) = match request.action_type {
            ActionType::Submit => {
                if request.job_type.is_empty() {
                    return Err(Error::Validation(
                        "a SUBMIT request must name a job type".into(),
                    ));
                }
                let machine = self.machines.get(&request.job_type).ok_or_else(|| {
                    Error::Validation(format!("unknown job type: {}", request.job_type))
                })?;
                let prefiltered = machine
                    .prefilter(&request.parameters)
                    .map_err(|e| Error::Validation(e.to_string()))?;
                (prefiltered.sanitized, prefiltered.secrets)
            }
            ActionType::Cancel => {
                if !request.job_type.is_empty() {
                    return Err(Error::Validation(
                        "a CANCEL request must not name a job type".into(),
                    ));
                }
                if request.job_id.is_none() {
                    return Err(Error::NotFound("cancel request names no job".into()));
                }
                (Value::Null, Default::default())
            }
        };

        let submit_date = Utc::now();
        let row = RequestRow {
            id: Uuid::new_v4(),
            action_type: request.action_type,
            job_type: request.job_type,
            job_id: request.job_id,
            requester: request.requester,
            parameters,
            priority: request.priority,
            time_slot: request.time_slot,
            timeout: request.timeout,
            start_date: request.start_date,
            submit_date,
            state: RequestState::Pending,
            result: None,
        };

        // Step 1: stage the row; it has an id but is not yet visible.
        let id = self.ledger.stage_request(row)?;

        // Step 2: ferry the secrets through the mediator, keyed by the
        // staged id.
        if !secrets.is_empty() {
            let names: Vec<&str> = secrets.keys().map(String::as_str).collect();
            let ttl = secret_ttl(submit_date, request.start_date);
            if let Err(e) = self
                .mediator
                .set(&secret_key(id), &CacheValue::Map(secrets.clone()), Some(ttl))
            {
                let names = names.join(", ");
                self.ledger.discard_request(id)?;
                debug!(request_id = %id, error = %e, "secret store failed, request discarded");
                return Err(Error::Validation(format!(
                    "could not store secret variables [{names}]: {e}"
                )));
            }
        }

        // Step 3: commit; only now does the request exist for readers.
        self.ledger.commit_request(id)?;
        info!(request_id = %id, action = ?request.action_type, "request accepted");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::machine::{EchoMachine, MachineRegistry};
    use crate::mediator::{FlakyFactory, MemoryBackend};
    use chrono::Duration;
    use serde_json::json;

    fn registry() -> Arc<MachineRegistry> {
        let mut machines = MachineRegistry::new();
        machines.register(Arc::new(EchoMachine::new()));
        Arc::new(machines)
    }

    fn gateway_over(backend: MemoryBackend) -> (Gateway, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        let mediator = Arc::new(Mediator::new(Box::new(backend)));
        (
            Gateway::new(ledger.clone(), mediator, registry()),
            ledger,
        )
    }

    #[test]
    fn test_ttl_is_one_day_plus_the_scheduled_delay() {
        let submit = Utc::now();
        assert_eq!(secret_ttl(submit, None), 86_400);
        assert_eq!(
            secret_ttl(submit, Some(submit + Duration::hours(2))),
            86_400 + 7_200
        );
        // A start date in the past never shrinks the TTL below a day.
        assert_eq!(secret_ttl(submit, Some(submit - Duration::hours(2))), 86_400);
    }

    #[test]
    fn test_submit_requires_a_job_type() {
        let (gateway, _) = gateway_over(MemoryBackend::new());
        let mut request = NewRequest::submit("", "alice", json!("echo hi"));
        request.job_type = String::new();
        assert!(matches!(
            gateway.submit(request),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_cancel_rejects_a_job_type_and_requires_a_target() {
        let (gateway, _) = gateway_over(MemoryBackend::new());

        let mut bad = NewRequest::cancel(Uuid::new_v4(), "alice");
        bad.job_type = "echo".into();
        assert!(matches!(gateway.submit(bad), Err(Error::Validation(_))));

        let mut missing = NewRequest::cancel(Uuid::new_v4(), "alice");
        missing.job_id = None;
        assert!(matches!(gateway.submit(missing), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_prefilter_parse_failure_is_a_bad_request_with_no_row() {
        let (gateway, ledger) = gateway_over(MemoryBackend::new());
        let request = NewRequest::submit("echo", "alice", json!(42));
        assert!(matches!(gateway.submit(request), Err(Error::Validation(_))));
        assert!(ledger.pending_requests().unwrap().is_empty());
    }

    #[test]
    fn test_secrets_land_in_the_mediator_under_the_request_key() {
        let backend = MemoryBackend::new();
        let (gateway, ledger) = gateway_over(backend.clone());
        let request = NewRequest::submit(
            "echo",
            "alice",
            json!({"command": "echo hi", "secrets": {"TOKEN": "t0p"}}),
        );
        let id = gateway.submit(request).unwrap();

        assert_eq!(backend.len(), 1);
        let ttl = backend.ttl_remaining(&secret_key(id)).unwrap();
        assert!(ttl.as_secs() > 86_000, "ttl was {ttl:?}");

        // The persisted row must not contain the secret value.
        let row = ledger.get_request(id).unwrap().unwrap();
        assert!(!row.parameters.to_string().contains("t0p"));
    }

    #[test]
    fn test_mediator_failure_rolls_back_the_staged_row() {
        // Enough injected failures to defeat the reconnect-once policy.
        let backend = MemoryBackend::new();
        let flaky = FlakyFactory::new(Box::new(backend.clone()), 10);
        let ledger: Arc<MemoryLedger> = Arc::new(MemoryLedger::new());
        let gateway = Gateway::new(
            ledger.clone(),
            Arc::new(Mediator::new(Box::new(flaky))),
            registry(),
        );

        let request = NewRequest::submit(
            "echo",
            "alice",
            json!({"command": "echo hi", "secrets": {"TOKEN": "t0p"}}),
        );
        let err = gateway.submit(request).unwrap_err();
        match err {
            Error::Validation(msg) => assert!(msg.contains("TOKEN"), "message was: {msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(ledger.pending_requests().unwrap().is_empty());
        assert!(backend.is_empty());
    }

    #[test]
    fn test_secretless_submissions_skip_the_mediator() {
        let backend = MemoryBackend::new();
        let (gateway, ledger) = gateway_over(backend.clone());
        let id = gateway
            .submit(NewRequest::submit("echo", "alice", json!("echo hi")))
            .unwrap();
        assert!(backend.is_empty());
        assert_eq!(ledger.pending_requests().unwrap()[0].id, id);
    }
}
