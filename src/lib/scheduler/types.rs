use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::lib::error::Result;

pub type ActionResult = Result<()>;

/// A zero-argument unit of work bound to a scheduled task.
#[async_trait]
pub trait TaskAction: Send + Sync {
    async fn run(&self) -> ActionResult;
}

/// Adapts an async closure into a `TaskAction`.
pub struct FnAction<F>(pub F);

#[async_trait]
impl<F, Fut> TaskAction for FnAction<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    async fn run(&self) -> ActionResult {
        (self.0)().await
    }
}

/// Externally visible state of a scheduled task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInfo {
    pub id: String,
    pub name: String,
    pub schedule: String,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}
