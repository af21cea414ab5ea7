//! Client poller
//!
//! Drives submit → poll → act for interactive callers. All waiting is
//! blocking polling at a fixed interval; there is no push channel. A
//! local interrupt raises a [`CancelSignal`] that is checked between poll
//! iterations: the caller-supplied confirm callback then decides whether
//! a CANCEL request is issued — declining clears the signal, warns
//! through the progress sink, and leaves the job running. Stopping a
//! local wait never cancels server-side work by itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::PollerSettings;
use crate::error::{Error, Result};
use crate::gateway::{Gateway, NewRequest};
use crate::ledger::{ActionType, JobId, JobState, Ledger, RequestId, RequestState};
use crate::output::OutputGateway;

/// Progress reported per poll until the hold point
pub const PROGRESS_STEP: u8 = 10;

/// Progress holds here until the request turns terminal
pub const PROGRESS_HOLD: u8 = 90;

/// Receives coarse progress and cautions during waits
pub trait Progress {
    /// Percent complete, monotonically non-decreasing
    fn percent(&mut self, percent: u8);
    /// Human-readable caution or warning; never a failure
    fn note(&mut self, message: &str);
}

/// Progress sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl Progress for NullProgress {
    fn percent(&mut self, _percent: u8) {}
    fn note(&mut self, _message: &str) {}
}

/// Cooperative local cancellation flag, checked between poll iterations
#[derive(Clone, Default)]
pub struct CancelSignal {
    raised: Arc<AtomicBool>,
}

impl CancelSignal {
    /// Create an unraised signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal; the next poll iteration will see it
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    /// Whether the signal is currently raised
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Clear the signal, e.g. after the caller declined to cancel
    pub fn clear(&self) {
        self.raised.store(false, Ordering::SeqCst);
    }

    /// Wire the signal to Ctrl-C. Returns an error if a handler is
    /// already installed for this process.
    pub fn install_ctrlc(&self) -> Result<()> {
        let raised = Arc::clone(&self.raised);
        ctrlc::set_handler(move || raised.store(true, Ordering::SeqCst))
            .map_err(|e| Error::Configuration(format!("cannot install interrupt handler: {e}")))
    }
}

/// Outcome of waiting on a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The request reached COMPLETED
    Completed {
        /// The admitted job (SUBMIT) or the cancelled target (CANCEL)
        job_id: Option<JobId>,
        /// Stored result text
        result: String,
    },
    /// The poll ceiling passed with the request still PENDING; admission
    /// may yet complete — this is a caution, not a failure
    StillPending {
        /// The outstanding request
        request_id: RequestId,
    },
}

/// Poll intervals and page sizes
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Interval between request polls
    pub request_poll: Duration,
    /// Ceiling after which a pending request is reported, not failed
    pub request_ceiling: Duration,
    /// Interval between job-start polls
    pub start_poll: Duration,
    /// Lines per tail page
    pub tail_page: usize,
    /// Sleep between tail polls on a short page
    pub tail_poll: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self::from(&PollerSettings::default())
    }
}

impl From<&PollerSettings> for PollerConfig {
    fn from(settings: &PollerSettings) -> Self {
        Self {
            request_poll: Duration::from_millis(settings.request_poll_ms),
            request_ceiling: Duration::from_millis(settings.request_ceiling_ms),
            start_poll: Duration::from_millis(settings.start_poll_ms),
            tail_page: settings.tail_page_lines,
            tail_poll: Duration::from_millis(settings.tail_poll_ms),
        }
    }
}

/// Blocking client driver for submit/poll/tail workflows
pub struct Poller {
    gateway: Arc<Gateway>,
    ledger: Arc<dyn Ledger>,
    output: Arc<OutputGateway>,
    config: PollerConfig,
    signal: CancelSignal,
}

impl Poller {
    /// Create a poller over the client-facing services
    pub fn new(
        gateway: Arc<Gateway>,
        ledger: Arc<dyn Ledger>,
        output: Arc<OutputGateway>,
        config: PollerConfig,
    ) -> Self {
        Self {
            gateway,
            ledger,
            output,
            config,
            signal: CancelSignal::new(),
        }
    }

    /// Use an externally shared cancel signal (e.g. wired to Ctrl-C)
    pub fn with_signal(mut self, signal: CancelSignal) -> Self {
        self.signal = signal;
        self
    }

    /// The signal checked between poll iterations
    pub fn signal(&self) -> &CancelSignal {
        &self.signal
    }

    /// Submit a request and block until it reaches a terminal state or
    /// the poll ceiling passes. COMPLETED returns the linked job id;
    /// FAILED surfaces the stored result text as an error; the ceiling
    /// yields [`WaitOutcome::StillPending`] with a caution.
    pub fn submit_and_wait(
        &self,
        request: NewRequest,
        progress: &mut dyn Progress,
        confirm: &mut dyn FnMut() -> bool,
    ) -> Result<WaitOutcome> {
        let action = request.action_type;
        let request_id = self.gateway.submit(request)?;
        debug!(%request_id, "request submitted, polling for admission");

        let started = Instant::now();
        let mut percent = 0u8;
        loop {
            let row = self
                .ledger
                .get_request(request_id)?
                .ok_or_else(|| Error::NotFound(format!("request {request_id}")))?;

            match row.state {
                RequestState::Completed => {
                    progress.percent(100);
                    let result = row.result.unwrap_or_default();
                    return Ok(WaitOutcome::Completed {
                        job_id: row.job_id,
                        result,
                    });
                }
                RequestState::Failed => {
                    return Err(Error::JobFailed(row.result.unwrap_or_default()));
                }
                RequestState::Pending => {}
            }

            if started.elapsed() >= self.config.request_ceiling {
                progress.note(&format!(
                    "request {request_id} still pending after {}s; it may yet complete",
                    self.config.request_ceiling.as_secs()
                ));
                return Ok(WaitOutcome::StillPending { request_id });
            }

            percent = (percent + PROGRESS_STEP).min(PROGRESS_HOLD);
            progress.percent(percent);

            // Cancelling an unadmitted SUBMIT has no job to target yet.
            let target = if action == ActionType::Submit {
                row.job_id
            } else {
                None
            };
            self.check_interrupt(target, progress, confirm)?;
            thread::sleep(self.config.request_poll);
        }
    }

    /// Block until the job leaves WAITING; returns the state it moved to
    pub fn wait_for_start(
        &self,
        job_id: JobId,
        progress: &mut dyn Progress,
        confirm: &mut dyn FnMut() -> bool,
    ) -> Result<JobState> {
        loop {
            let row = self
                .ledger
                .get_job(job_id)?
                .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
            if row.state != JobState::Waiting {
                return Ok(row.state);
            }
            self.check_interrupt(Some(job_id), progress, confirm)?;
            thread::sleep(self.config.start_poll);
        }
    }

    /// Tail the job's output into `sink` until the job is terminal.
    /// FAILED surfaces the stored result as an error after the remaining
    /// output is delivered.
    pub fn tail_output(
        &self,
        job_id: JobId,
        sink: &mut dyn FnMut(&str),
        progress: &mut dyn Progress,
        confirm: &mut dyn FnMut() -> bool,
    ) -> Result<()> {
        let mut offset = 0usize;
        loop {
            let page = self
                .output
                .read_output(job_id, offset, self.config.tail_page as i64)?;
            let lines = page.lines().count();
            if lines > 0 {
                sink(&page);
                offset += lines;
            }
            if lines == self.config.tail_page {
                continue; // full page, more may be ready right now
            }

            let row = self
                .ledger
                .get_job(job_id)?
                .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
            match row.state {
                JobState::Failed => {
                    return Err(Error::JobFailed(row.result.unwrap_or_default()))
                }
                state if state.is_terminal() => return Ok(()),
                _ => {
                    self.check_interrupt(Some(job_id), progress, confirm)?;
                    thread::sleep(self.config.tail_poll);
                }
            }
        }
    }

    /// Handle a raised cancel signal: ask for confirmation, then issue a
    /// CANCEL request through the gateway. Declining clears the signal
    /// and warns; the job keeps running either way until the server-side
    /// cancel lands.
    fn check_interrupt(
        &self,
        job_id: Option<JobId>,
        progress: &mut dyn Progress,
        confirm: &mut dyn FnMut() -> bool,
    ) -> Result<()> {
        if !self.signal.is_raised() {
            return Ok(());
        }
        if !confirm() {
            self.signal.clear();
            progress.note("cancellation declined; the job keeps running");
            return Ok(());
        }
        match job_id {
            Some(job_id) => {
                let request_id = self
                    .gateway
                    .submit(NewRequest::cancel(job_id, "local-interrupt"))?;
                progress.note(&format!(
                    "cancel requested for job {job_id} (request {request_id})"
                ));
                Err(Error::JobFailed(format!(
                    "wait interrupted; cancel requested for job {job_id}"
                )))
            }
            None => {
                self.signal.clear();
                progress.note("no job admitted yet; nothing to cancel");
                Ok(())
            }
        }
    }
}
