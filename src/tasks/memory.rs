use super::{CreateTaskRequest, TaskScheduler};
use crate::error::CounterError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Scheduler that keeps every accepted request in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingScheduler {
    requests: Arc<Mutex<Vec<CreateTaskRequest>>>,
    failures_left: Arc<AtomicUsize>,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects the next `times` requests with a scheduler error.
    pub fn fail_next(&self, times: usize) {
        self.failures_left.fetch_add(times, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<CreateTaskRequest> {
        self.requests.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains the accepted requests, as a delivery loop would.
    pub fn take(&self) -> Vec<CreateTaskRequest> {
        std::mem::take(&mut *self.requests.lock())
    }
}

impl TaskScheduler for RecordingScheduler {
    async fn create_task(&self, request: CreateTaskRequest) -> Result<(), CounterError> {
        let rejected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(CounterError::scheduler(format!(
                "queue '{}' rejected task '{}'",
                request.queue, request.task.name
            )));
        }
        self.requests.lock().push(request);
        Ok(())
    }
}
