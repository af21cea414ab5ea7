//! Request and job lifecycle tests
//!
//! End-to-end flows through gateway, ledger, mediator and scheduler:
//! admission of an echo submission, secret choreography, delayed starts,
//! and cancellation of existing and non-existent jobs.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use common::{drive_until, stack};
use jobgate::ledger::Ledger;
use jobgate::mediator::secret_key;
use jobgate::{JobState, NewRequest, RequestState};

// =============================================================================
// Happy path: SUBMIT echo reaches COMPLETED end to end
// =============================================================================

#[test]
fn test_echo_submission_runs_to_completion() {
    let stack = stack();
    let request_id = stack
        .gateway
        .submit(NewRequest::submit("echo", "alice", json!("echo hi")))
        .unwrap();

    assert!(drive_until(&stack.scheduler, || {
        stack
            .ledger
            .get_request(request_id)
            .unwrap()
            .unwrap()
            .state
            .is_terminal()
    }));

    let request = stack.ledger.get_request(request_id).unwrap().unwrap();
    assert_eq!(request.state, RequestState::Completed);
    let job_id = request.job_id.expect("completed SUBMIT links a job");

    assert!(drive_until(&stack.scheduler, || {
        stack.ledger.get_job(job_id).unwrap().unwrap().state.is_terminal()
    }));

    let job = stack.ledger.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    let start = job.start_date.expect("started job has a start date");
    let end = job.end_date.expect("terminal job has an end date");
    assert!(end > start, "end {end} must follow start {start}");
    assert!(start > job.submit_date, "start must follow submission");

    let output = stack.output.read_output(job_id, 0, -1).unwrap();
    assert_eq!(output, "hi\n");
}

// =============================================================================
// Secret choreography
// =============================================================================

#[test]
fn test_secrets_are_consumed_exactly_once_by_the_run() {
    let stack = stack();
    let request_id = stack
        .gateway
        .submit(NewRequest::submit(
            "echo",
            "alice",
            json!({"command": "echo done", "secrets": {"DB_PASS": "hunter2"}}),
        ))
        .unwrap();

    // The bundle exists while the request is pending.
    assert_eq!(stack.backend.len(), 1);

    let terminal = |job_id: uuid::Uuid| {
        let ledger = stack.ledger.clone();
        move || ledger.get_job(job_id).unwrap().unwrap().state.is_terminal()
    };
    assert!(drive_until(&stack.scheduler, || {
        stack
            .ledger
            .get_request(request_id)
            .unwrap()
            .map(|r| r.state.is_terminal())
            .unwrap_or(false)
    }));
    let job_id = stack
        .ledger
        .get_request(request_id)
        .unwrap()
        .unwrap()
        .job_id
        .unwrap();
    assert!(drive_until(&stack.scheduler, terminal(job_id)));

    // Read-once: the bundle is gone after the run started.
    assert_eq!(stack.mediator.get(&secret_key(request_id)).unwrap(), None);

    // The run saw the secret name; the value never reached any output.
    let output = stack.output.read_output(job_id, 0, -1).unwrap();
    assert!(output.contains("secret available: DB_PASS"));
    assert!(!output.contains("hunter2"));
}

// =============================================================================
// Delayed start
// =============================================================================

#[test]
fn test_future_start_date_parks_the_job_until_wake_time() {
    let stack = stack();
    let request_id = stack
        .gateway
        .submit(
            NewRequest::submit("echo", "alice", json!("echo later"))
                .with_start_date(Utc::now() + ChronoDuration::hours(1)),
        )
        .unwrap();

    assert!(drive_until(&stack.scheduler, || {
        stack
            .ledger
            .get_request(request_id)
            .unwrap()
            .unwrap()
            .state
            .is_terminal()
    }));
    let job_id = stack
        .ledger
        .get_request(request_id)
        .unwrap()
        .unwrap()
        .job_id
        .unwrap();

    // Blocked, not ready.
    let queues = stack.scheduler.get_waiting_queues();
    assert!(queues.iter().all(|q| !q.ready.contains(&job_id)));
    assert!(queues
        .iter()
        .any(|q| q.blocked.iter().any(|(id, _)| *id == job_id)));
    assert_eq!(
        stack.ledger.get_job(job_id).unwrap().unwrap().state,
        JobState::Waiting
    );

    // Jump past the wake time: one pass with a synthetic clock releases
    // and starts it.
    stack
        .scheduler
        .run_pending(Utc::now() + ChronoDuration::hours(2))
        .unwrap();
    assert!(drive_until(&stack.scheduler, || {
        stack.ledger.get_job(job_id).unwrap().unwrap().state.is_terminal()
    }));
    assert_eq!(
        stack.ledger.get_job(job_id).unwrap().unwrap().state,
        JobState::Completed
    );
}

// =============================================================================
// Cancellation
// =============================================================================

#[test]
fn test_cancel_for_a_nonexistent_job_fails_the_request_and_touches_no_job() {
    let stack = stack();
    let bogus = uuid::Uuid::new_v4();
    let request_id = stack
        .gateway
        .submit(NewRequest::cancel(bogus, "alice"))
        .unwrap();

    assert!(drive_until(&stack.scheduler, || {
        stack
            .ledger
            .get_request(request_id)
            .unwrap()
            .unwrap()
            .state
            .is_terminal()
    }));

    let request = stack.ledger.get_request(request_id).unwrap().unwrap();
    assert_eq!(request.state, RequestState::Failed);
    let result = request.result.unwrap();
    assert!(result.contains("not found"), "result was: {result}");
    assert!(stack.ledger.get_job(bogus).unwrap().is_none());
}

#[test]
fn test_cancelling_a_running_job_passes_through_cleaningup() {
    let stack = stack();
    let request_id = stack
        .gateway
        .submit(NewRequest::submit(
            "echo",
            "alice",
            json!({"command": "echo slow", "sleep_ms": 5_000}),
        ))
        .unwrap();

    assert!(drive_until(&stack.scheduler, || {
        stack
            .ledger
            .get_request(request_id)
            .unwrap()
            .unwrap()
            .job_id
            .map(|job_id| {
                stack.ledger.get_job(job_id).unwrap().unwrap().state == JobState::Running
            })
            .unwrap_or(false)
    }));
    let job_id = stack
        .ledger
        .get_request(request_id)
        .unwrap()
        .unwrap()
        .job_id
        .unwrap();

    let state = stack.scheduler.cancel_job(job_id).unwrap();
    assert_eq!(state, JobState::CleaningUp);

    assert!(drive_until(&stack.scheduler, || {
        stack.ledger.get_job(job_id).unwrap().unwrap().state.is_terminal()
    }));
    let job = stack.ledger.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.result.as_deref(), Some("cancelled"));
    assert!(job.end_date.is_some());
}

#[test]
fn test_cancelling_a_waiting_job_fails_it_without_a_start_date() {
    let stack = stack();
    let request_id = stack
        .gateway
        .submit(
            NewRequest::submit("echo", "alice", json!("echo parked"))
                .with_start_date(Utc::now() + ChronoDuration::hours(1)),
        )
        .unwrap();
    assert!(drive_until(&stack.scheduler, || {
        stack
            .ledger
            .get_request(request_id)
            .unwrap()
            .unwrap()
            .state
            .is_terminal()
    }));
    let job_id = stack
        .ledger
        .get_request(request_id)
        .unwrap()
        .unwrap()
        .job_id
        .unwrap();

    let state = stack.scheduler.cancel_job(job_id).unwrap();
    assert_eq!(state, JobState::Failed);
    let job = stack.ledger.get_job(job_id).unwrap().unwrap();
    assert!(job.start_date.is_none(), "never left WAITING");
    assert!(job.end_date.is_some());

    // Idempotent on a terminal job: same answer, no error.
    assert_eq!(stack.scheduler.cancel_job(job_id).unwrap(), JobState::Failed);
}

// =============================================================================
// Timeout enforcement
// =============================================================================

#[test]
fn test_a_job_over_its_budget_is_failed_with_a_timeout_result() {
    let stack = stack();
    let request_id = stack
        .gateway
        .submit(
            NewRequest::submit(
                "echo",
                "alice",
                json!({"command": "echo slow", "sleep_ms": 60_000}),
            )
            .with_timeout(1),
        )
        .unwrap();

    assert!(drive_until(&stack.scheduler, || {
        stack
            .ledger
            .get_request(request_id)
            .unwrap()
            .unwrap()
            .state
            .is_terminal()
    }));
    let job_id = stack
        .ledger
        .get_request(request_id)
        .unwrap()
        .unwrap()
        .job_id
        .unwrap();

    // Drive with a clock far past the deadline so the reaper signals the
    // run; the machine notices the cancel flag within a few milliseconds.
    assert!(drive_until(&stack.scheduler, || {
        stack
            .scheduler
            .run_pending(Utc::now() + ChronoDuration::seconds(10))
            .unwrap();
        stack.ledger.get_job(job_id).unwrap().unwrap().state.is_terminal()
    }));

    let job = stack.ledger.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.result.unwrap().contains("timed out"));
}
