//! Scheduler
//!
//! Owns admission control and everything that happens to a job after its
//! request is committed: schema validation, resource resolution,
//! permission checks, queue bookkeeping, dispatch onto worker threads,
//! timeout enforcement, and cancellation. The scheduler is the single
//! writer of request terminal states and of job state after creation.
//!
//! Dispatch is driven by [`Scheduler::run_pending`], one pass of:
//! admit committed PENDING requests, release due delayed jobs, reap
//! finished runs, start ready jobs up to the concurrency limit. A
//! background dispatcher thread can call it on a fixed tick, or tests can
//! drive it directly with a synthetic clock.

mod authority;
mod queue;

pub use authority::{
    AuthorityError, PermissionAuthority, PermissionBackend, ResourceAuthority, ResourceBackend,
    ResourceClaim,
};
pub use queue::{QueueKey, QueueSnapshot, WaitingQueues};

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ledger::{
    next_submit_seq, ActionType, JobId, JobRow, JobState, Ledger, RequestRow, RequestState,
    SecretVars, TimeSlot,
};
use crate::machine::{MachineRegistry, OutputSink, RunContext};
use crate::mediator::{secret_key, Mediator, Value as CacheValue};

/// Default concurrently running jobs
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Name of the stdout artifact inside a job's spool directory
pub const OUTPUT_FILE: &str = "output";

/// Whether `add_job` started the job immediately or queued it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Execution began in the same call
    Started,
    /// The job waits in a queue or the delayed set
    Waiting,
}

/// Everything needed to admit one task
#[derive(Debug, Clone)]
pub struct TaskDef {
    /// Execution machine type
    pub job_type: String,
    /// Caller the job runs on behalf of
    pub requester: String,
    /// Prefiltered parameters
    pub parameters: Value,
    /// Queue partition
    pub time_slot: TimeSlot,
    /// Run budget in seconds, 0 = unbounded
    pub timeout: u64,
    /// Human-readable description
    pub description: String,
    /// Submission time of the originating request
    pub submit_date: DateTime<Utc>,
    /// Request whose secret bundle the run should consume, if any
    pub secret_ref: Option<Uuid>,
}

struct RunHandle {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<std::result::Result<String, String>>,
    deadline: Option<DateTime<Utc>>,
    timed_out: bool,
}

#[derive(Default)]
struct Inner {
    queues: WaitingQueues,
    running: HashMap<JobId, RunHandle>,
    secret_refs: HashMap<JobId, Uuid>,
}

/// Admission control and queue bookkeeping
pub struct Scheduler {
    ledger: Arc<dyn Ledger>,
    mediator: Arc<Mediator>,
    machines: Arc<MachineRegistry>,
    permission: PermissionAuthority,
    resources: ResourceAuthority,
    spool: PathBuf,
    max_concurrency: usize,
    inner: Mutex<Inner>,
}

impl Scheduler {
    /// Create a scheduler with permissive stub authorities
    pub fn new(
        ledger: Arc<dyn Ledger>,
        mediator: Arc<Mediator>,
        machines: Arc<MachineRegistry>,
        spool: PathBuf,
    ) -> Self {
        Self {
            ledger,
            mediator,
            machines,
            permission: PermissionAuthority::Stub,
            resources: ResourceAuthority::Stub,
            spool,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Select the authorities; done once at construction, never swapped
    /// at runtime
    pub fn with_authorities(
        mut self,
        permission: PermissionAuthority,
        resources: ResourceAuthority,
    ) -> Self {
        self.permission = permission;
        self.resources = resources;
        self
    }

    /// Cap on concurrently running jobs
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Directory a job's artifacts are spooled under
    pub fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.spool.join(job_id.to_string())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit one task: validate its parameters against the machine's
    /// declared schema, resolve and permission-check its resources, then
    /// enqueue it (or park it until `run_at`). Returns the job id and
    /// whether execution began immediately.
    pub fn add_job(
        &self,
        task: TaskDef,
        priority: i32,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<(JobId, QueueState)> {
        let machine = self
            .machines
            .get(&task.job_type)
            .ok_or_else(|| Error::Validation(format!("unknown job type: {}", task.job_type)))?;

        let violations = machine.schema().violations(&task.parameters);
        if !violations.is_empty() {
            return Err(Error::Validation(format!(
                "parameters do not match the {} schema: {}",
                task.job_type,
                violations.join("; ")
            )));
        }

        let claims = self
            .resources
            .resolve(&task.job_type, &task.parameters, &task.requester)
            .map_err(|e| Error::Transient(e.to_string()))?;
        let mut denied = Vec::new();
        for claim in &claims {
            let allowed = self
                .permission
                .can_use(&task.requester, claim)
                .map_err(|e| Error::Transient(e.to_string()))?;
            if !allowed {
                denied.push(claim.name.clone());
            }
        }
        if !denied.is_empty() {
            return Err(Error::not_authorized(denied));
        }

        let now = Utc::now();
        let row = JobRow {
            id: Uuid::new_v4(),
            job_type: task.job_type.clone(),
            requester: task.requester.clone(),
            priority,
            time_slot: task.time_slot,
            state: JobState::Waiting,
            resources: serde_json::to_value(&claims).unwrap_or(Value::Null),
            parameters: task.parameters.clone(),
            description: task.description.clone(),
            submit_date: task.submit_date,
            start_date: None,
            end_date: None,
            result: None,
            timeout: task.timeout,
            submit_seq: next_submit_seq(),
        };
        let job_id = row.id;
        let key = QueueKey {
            priority,
            seq: row.submit_seq,
            job_id,
        };
        self.ledger.insert_job(row)?;

        let mut inner = self.lock();
        if let Some(secret_ref) = task.secret_ref {
            inner.secret_refs.insert(job_id, secret_ref);
        }
        let state = match run_at {
            Some(wake) if wake > now => {
                inner.queues.push_delayed(task.time_slot, key, wake);
                QueueState::Waiting
            }
            _ => {
                inner.queues.push(task.time_slot, key);
                self.start_ready(&mut inner, now);
                if inner.running.contains_key(&job_id) {
                    QueueState::Started
                } else {
                    QueueState::Waiting
                }
            }
        };
        info!(%job_id, job_type = %task.job_type, ?state, "job admitted");
        Ok((job_id, state))
    }

    /// Cancel a job. Idempotent: a job already terminal returns its
    /// existing state, never an error.
    pub fn cancel_job(&self, job_id: JobId) -> Result<JobState> {
        let mut row = self
            .ledger
            .get_job(job_id)?
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;

        if row.state.is_terminal() {
            return Ok(row.state);
        }

        let now = Utc::now();
        match row.state {
            JobState::Waiting => {
                let mut inner = self.lock();
                inner.queues.remove(job_id);
                if let Some(secret_ref) = inner.secret_refs.remove(&job_id) {
                    // Best effort: TTL reaps the bundle if the cache is down.
                    if let Err(e) = self.mediator.set_none(&secret_key(secret_ref)) {
                        warn!(%job_id, error = %e, "could not drop secret bundle");
                    }
                }
                drop(inner);
                row.finish(JobState::Failed, "cancelled before start", now)?;
                self.ledger.put_job(row)?;
                info!(%job_id, "waiting job cancelled");
                Ok(JobState::Failed)
            }
            JobState::Running => {
                let inner = self.lock();
                if let Some(handle) = inner.running.get(&job_id) {
                    handle.cancel.store(true, Ordering::SeqCst);
                }
                drop(inner);
                row.transition(JobState::CleaningUp, now)?;
                self.ledger.put_job(row)?;
                info!(%job_id, "running job signalled to cancel");
                Ok(JobState::CleaningUp)
            }
            JobState::CleaningUp => Ok(JobState::CleaningUp),
            JobState::Completed | JobState::Failed => unreachable!("terminal handled above"),
        }
    }

    /// Snapshot of a job row
    pub fn get_job(&self, job_id: JobId) -> Result<JobRow> {
        self.ledger
            .get_job(job_id)?
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))
    }

    /// Read-only snapshot of every queue partition
    pub fn get_waiting_queues(&self) -> Vec<QueueSnapshot> {
        self.lock().queues.snapshot()
    }

    /// One dispatch pass: admit pending requests, release due delayed
    /// jobs, reap finished runs, start ready jobs. `now` is injectable so
    /// tests can drive delayed-release without sleeping.
    pub fn run_pending(&self, now: DateTime<Utc>) -> Result<()> {
        for request in self.ledger.pending_requests()? {
            self.admit_request(&request)?;
        }
        let mut inner = self.lock();
        inner.queues.release_due(now);
        self.reap_finished(&mut inner, now)?;
        self.start_ready(&mut inner, now);
        Ok(())
    }

    /// Carry out one committed PENDING request and write its terminal
    /// state exactly once.
    fn admit_request(&self, request: &RequestRow) -> Result<()> {
        match request.action_type {
            ActionType::Submit => {
                let task = TaskDef {
                    job_type: request.job_type.clone(),
                    requester: request.requester.clone(),
                    parameters: request.parameters.clone(),
                    time_slot: request.time_slot,
                    timeout: request.timeout,
                    description: format!("{} job for {}", request.job_type, request.requester),
                    submit_date: request.submit_date,
                    secret_ref: Some(request.id),
                };
                match self.add_job(task, request.priority, request.start_date) {
                    Ok((job_id, state)) => {
                        self.ledger.finish_request(
                            request.id,
                            RequestState::Completed,
                            &format!("admitted; {state:?}"),
                            Some(job_id),
                        )?;
                    }
                    Err(err) => {
                        // The bundle was written before the request was
                        // committed; drop it now that admission failed.
                        if let Err(e) = self.mediator.set_none(&secret_key(request.id)) {
                            warn!(request_id = %request.id, error = %e,
                                "could not drop secret bundle of rejected request");
                        }
                        self.ledger.finish_request(
                            request.id,
                            RequestState::Failed,
                            &err.to_string(),
                            None,
                        )?;
                    }
                }
            }
            ActionType::Cancel => {
                let outcome = match request.job_id {
                    Some(target) => self.cancel_job(target),
                    None => Err(Error::NotFound("cancel request names no job".into())),
                };
                match outcome {
                    Ok(state) => {
                        self.ledger.finish_request(
                            request.id,
                            RequestState::Completed,
                            &format!("cancel issued; job state {state:?}"),
                            request.job_id,
                        )?;
                    }
                    Err(err) => {
                        self.ledger.finish_request(
                            request.id,
                            RequestState::Failed,
                            &err.to_string(),
                            None,
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Join finished runs and write their terminal states; signal
    /// cancellation to runs past their timeout budget.
    fn reap_finished(&self, inner: &mut Inner, now: DateTime<Utc>) -> Result<()> {
        for (job_id, handle) in inner.running.iter_mut() {
            if let Some(deadline) = handle.deadline {
                if now > deadline && !handle.timed_out {
                    handle.timed_out = true;
                    handle.cancel.store(true, Ordering::SeqCst);
                    warn!(%job_id, "job exceeded its timeout budget, signalling cancel");
                }
            }
        }

        let finished: Vec<JobId> = inner
            .running
            .iter()
            .filter(|(_, h)| h.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for job_id in finished {
            let handle = match inner.running.remove(&job_id) {
                Some(h) => h,
                None => continue,
            };
            let timed_out = handle.timed_out;
            let outcome = handle
                .handle
                .join()
                .unwrap_or_else(|_| Err("execution machine panicked".into()));

            let mut row = match self.ledger.get_job(job_id)? {
                Some(row) => row,
                None => continue,
            };
            let (state, result) = if timed_out {
                (JobState::Failed, format!("timed out after {}s", row.timeout))
            } else {
                match outcome {
                    Ok(text) => (JobState::Completed, text),
                    Err(text) => (JobState::Failed, text),
                }
            };
            row.finish(state, result, now)?;
            debug!(%job_id, ?state, "job reaped");
            self.ledger.put_job(row)?;
        }
        Ok(())
    }

    /// Start ready jobs while capacity remains
    fn start_ready(&self, inner: &mut Inner, now: DateTime<Utc>) {
        while inner.running.len() < self.max_concurrency {
            let key = match inner.queues.pop_next() {
                Some(key) => key,
                None => break,
            };
            if let Err(e) = self.start_job(inner, key.job_id, now) {
                warn!(job_id = %key.job_id, error = %e, "job failed to start");
            }
        }
    }

    /// Move one job WAITING → RUNNING and hand it to its machine on a
    /// worker thread. Every precondition is checked while the row is
    /// still WAITING; a failed precondition writes a terminal state
    /// rather than stranding a RUNNING row with no worker.
    fn start_job(&self, inner: &mut Inner, job_id: JobId, now: DateTime<Utc>) -> Result<()> {
        let mut row = self
            .ledger
            .get_job(job_id)?
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;

        let machine = match self.machines.get(&row.job_type) {
            Some(machine) => machine,
            None => {
                let job_type = row.job_type.clone();
                row.finish(
                    JobState::Failed,
                    format!("no machine registered for {job_type}"),
                    now,
                )?;
                self.ledger.put_job(row)?;
                return Ok(());
            }
        };

        let dir = self.job_dir(job_id);
        let file = match fs::create_dir_all(&dir)
            .and_then(|()| fs::File::create(dir.join(OUTPUT_FILE)))
        {
            Ok(file) => file,
            Err(e) => {
                row.finish(
                    JobState::Failed,
                    format!("could not prepare spool directory: {e}"),
                    now,
                )?;
                self.ledger.put_job(row)?;
                return Ok(());
            }
        };

        let secrets = match inner.secret_refs.remove(&job_id) {
            Some(secret_ref) => match self.mediator.take(&secret_key(secret_ref)) {
                Ok(Some(CacheValue::Map(vars))) => vars,
                Ok(_) => SecretVars::new(),
                Err(e) => {
                    // Never run a job that silently lost its secrets.
                    row.finish(
                        JobState::Failed,
                        format!("could not fetch secret variables: {e}"),
                        now,
                    )?;
                    self.ledger.put_job(row)?;
                    return Ok(());
                }
            },
            None => SecretVars::new(),
        };

        row.start(now)?;
        self.ledger.put_job(row.clone())?;

        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_for_run = Arc::clone(&cancel);
        let parameters = row.parameters.clone();
        let handle = thread::spawn(move || {
            let mut sink = OutputSink::new(Box::new(file));
            machine.run(RunContext {
                parameters: &parameters,
                secrets,
                output: &mut sink,
                cancelled: &cancel_for_run,
            })
        });

        let deadline = (row.timeout > 0).then(|| now + Duration::seconds(row.timeout as i64));
        inner.running.insert(
            job_id,
            RunHandle {
                cancel,
                handle,
                deadline,
                timed_out: false,
            },
        );
        debug!(%job_id, "job started");
        Ok(())
    }

    /// Spawn a background thread calling [`run_pending`](Self::run_pending)
    /// every `tick`
    pub fn spawn_dispatcher(self: &Arc<Self>, tick: StdDuration) -> DispatcherHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let scheduler = Arc::clone(self);
        let thread = thread::spawn(move || {
            while !stop_flag.load(Ordering::SeqCst) {
                if let Err(e) = scheduler.run_pending(Utc::now()) {
                    warn!(error = %e, "dispatch pass failed");
                }
                thread::sleep(tick);
            }
        });
        DispatcherHandle {
            stop,
            thread: Some(thread),
        }
    }
}

/// Handle to a running dispatcher thread; stops it on drop
pub struct DispatcherHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Stop the dispatcher and wait for the thread to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
