pub mod memory;

use crate::error::CounterError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HttpMethod {
    #[default]
    Post,
    Put,
    Get,
}

/// An HTTP call the scheduler delivers at or after `schedule_time`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTask {
    pub name: String,
    pub method: HttpMethod,
    pub url: String,
    pub body: Vec<u8>,
    pub schedule_time: SystemTime,
    /// Service account whose OIDC token authenticates the delivery.
    pub oidc_service_account: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTaskRequest {
    pub queue: String,
    pub task: HttpTask,
}

/// Deferred delivery queue. Delivery is at-least-once.
pub trait TaskScheduler: Send + Sync {
    fn create_task(
        &self,
        request: CreateTaskRequest,
    ) -> impl Future<Output = Result<(), CounterError>> + Send;
}

impl<S: TaskScheduler> TaskScheduler for Arc<S> {
    fn create_task(
        &self,
        request: CreateTaskRequest,
    ) -> impl Future<Output = Result<(), CounterError>> + Send {
        (**self).create_task(request)
    }
}
