//! In-memory ledger
//!
//! Process-local [`Ledger`] implementation used for embedding and tests.
//! Rows live behind one mutex; every trait method is a single critical
//! section, which gives the atomicity the trait asks for.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{
    JobId, JobRow, JobState, Ledger, LedgerError, RequestId, RequestRow, RequestState,
};

#[derive(Default)]
struct Store {
    staged: HashMap<RequestId, RequestRow>,
    requests: HashMap<RequestId, RequestRow>,
    request_order: Vec<RequestId>,
    jobs: HashMap<JobId, JobRow>,
    job_order: Vec<JobId>,
}

/// In-memory ledger with two-phase request visibility
#[derive(Default)]
pub struct MemoryLedger {
    store: Mutex<Store>,
}

impl MemoryLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        // A poisoned mutex means a panic mid-write; the row data is still
        // consistent because every write replaces whole rows.
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Ledger for MemoryLedger {
    fn stage_request(&self, row: RequestRow) -> Result<RequestId, LedgerError> {
        let id = row.id;
        self.lock().staged.insert(id, row);
        Ok(id)
    }

    fn commit_request(&self, id: RequestId) -> Result<(), LedgerError> {
        let mut store = self.lock();
        let row = store.staged.remove(&id).ok_or(LedgerError::NotFound(id))?;
        store.requests.insert(id, row);
        store.request_order.push(id);
        Ok(())
    }

    fn discard_request(&self, id: RequestId) -> Result<(), LedgerError> {
        self.lock()
            .staged
            .remove(&id)
            .map(|_| ())
            .ok_or(LedgerError::NotFound(id))
    }

    fn get_request(&self, id: RequestId) -> Result<Option<RequestRow>, LedgerError> {
        Ok(self.lock().requests.get(&id).cloned())
    }

    fn pending_requests(&self) -> Result<Vec<RequestRow>, LedgerError> {
        let store = self.lock();
        Ok(store
            .request_order
            .iter()
            .filter_map(|id| store.requests.get(id))
            .filter(|row| row.state == RequestState::Pending)
            .cloned()
            .collect())
    }

    fn finish_request(
        &self,
        id: RequestId,
        state: RequestState,
        result: &str,
        job_id: Option<JobId>,
    ) -> Result<(), LedgerError> {
        let mut store = self.lock();
        let row = store.requests.get_mut(&id).ok_or(LedgerError::NotFound(id))?;
        if row.state.is_terminal() {
            return Err(LedgerError::AlreadyFinal(id));
        }
        row.state = state;
        row.result = Some(result.to_string());
        if let Some(job_id) = job_id {
            row.job_id = Some(job_id);
        }
        Ok(())
    }

    fn insert_job(&self, row: JobRow) -> Result<(), LedgerError> {
        let mut store = self.lock();
        let id = row.id;
        store.jobs.insert(id, row);
        store.job_order.push(id);
        Ok(())
    }

    fn put_job(&self, row: JobRow) -> Result<(), LedgerError> {
        let mut store = self.lock();
        let id = row.id;
        if !store.jobs.contains_key(&id) {
            return Err(LedgerError::NotFound(id));
        }
        store.jobs.insert(id, row);
        Ok(())
    }

    fn get_job(&self, id: JobId) -> Result<Option<JobRow>, LedgerError> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    fn jobs_in_state(&self, state: JobState) -> Result<Vec<JobRow>, LedgerError> {
        let store = self.lock();
        Ok(store
            .job_order
            .iter()
            .filter_map(|id| store.jobs.get(id))
            .filter(|row| row.state == state)
            .cloned()
            .collect())
    }
}
