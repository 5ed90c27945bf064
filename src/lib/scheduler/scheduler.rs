use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::trigger::Trigger;
use super::types::{ActionResult, FnAction, TaskAction, TaskInfo};
use crate::lib::error::{OrchestratorError, Result};

/// Longest single sleep of a trigger loop. The wall clock is re-read after
/// each one, so NTP steps and host suspend shift a pending firing by at most
/// this much.
const MAX_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
enum Clock {
    /// The host wall clock.
    System,
    /// Wall time derived from tokio's monotonic clock, so it advances under a
    /// paused test runtime.
    #[cfg_attr(not(test), allow(dead_code))]
    Monotonic { instant: Instant, wall: DateTime<Utc> },
}

impl Clock {
    #[cfg(test)]
    fn monotonic() -> Self {
        Clock::Monotonic {
            instant: Instant::now(),
            wall: Utc::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Monotonic { instant, wall } => {
                let elapsed = chrono::Duration::from_std(instant.elapsed())
                    .unwrap_or_else(|_| chrono::Duration::zero());
                *wall + elapsed
            }
        }
    }
}

/// How long to sleep before looking at the clock again, or `None` once `next`
/// is due.
fn next_wait(now: DateTime<Utc>, next: DateTime<Utc>) -> Option<Duration> {
    if now >= next {
        return None;
    }
    let remaining = (next - now).to_std().unwrap_or_default();
    Some(remaining.min(MAX_WAIT))
}

struct Registration {
    token: CancellationToken,
    handle: JoinHandle<()>,
    generation: u64,
}

struct TaskEntry {
    id: String,
    name: String,
    schedule: String,
    enabled: bool,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    action: Arc<dyn TaskAction>,
    registration: Option<Registration>,
}

impl TaskEntry {
    fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            schedule: self.schedule.clone(),
            enabled: self.enabled,
            last_run: self.last_run,
            next_run: self.next_run,
        }
    }

    fn deregister(&mut self) -> Option<JoinHandle<()>> {
        self.next_run = None;
        self.registration.take().map(|r| {
            r.token.cancel();
            r.handle
        })
    }
}

type TaskMap = Arc<RwLock<HashMap<String, TaskEntry>>>;

/// Runs named actions on cron or interval triggers. Each active task owns one
/// trigger loop; disabling or removing the task cancels it.
pub struct Scheduler {
    tasks: TaskMap,
    root: Mutex<Option<CancellationToken>>,
    generation: AtomicU64,
    clock: Clock,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_clock(Clock::System)
    }

    fn with_clock(clock: Clock) -> Self {
        Scheduler {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            root: Mutex::new(None),
            generation: AtomicU64::new(0),
            clock,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.root.lock().await.is_some()
    }

    /// Registers triggers for every enabled task. Tasks added afterwards are
    /// registered as they are added.
    pub async fn start(&self) {
        let mut root = self.root.lock().await;
        if root.is_some() {
            return;
        }
        let token = CancellationToken::new();

        let mut tasks = self.tasks.write().await;
        for entry in tasks.values_mut().filter(|e| e.enabled) {
            match Trigger::parse(&entry.schedule) {
                Ok(trigger) => self.register(entry, trigger, &token),
                Err(e) => error!(task = %entry.id, error = %e, "cannot register task"),
            }
        }
        *root = Some(token);
        info!(tasks = tasks.len(), "scheduler started");
    }

    /// Cancels every trigger and waits for the loops to exit. Actions already
    /// running are allowed to finish.
    pub async fn stop(&self) {
        let Some(token) = self.root.lock().await.take() else {
            return;
        };
        token.cancel();

        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .write()
            .await
            .values_mut()
            .filter_map(TaskEntry::deregister)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "task trigger loop ended abnormally");
            }
        }
        info!("scheduler stopped");
    }

    /// Adds a task bound to an async closure.
    pub async fn add_task<F, Fut>(
        &self,
        id: &str,
        name: &str,
        schedule: &str,
        enabled: bool,
        action: F,
    ) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        self.add_action(id, name, schedule, enabled, Arc::new(FnAction(action)))
            .await
    }

    /// Adds a task. The schedule is validated even when the task starts
    /// disabled; an unparseable one leaves nothing registered.
    pub async fn add_action(
        &self,
        id: &str,
        name: &str,
        schedule: &str,
        enabled: bool,
        action: Arc<dyn TaskAction>,
    ) -> Result<()> {
        let trigger = match Trigger::parse(schedule) {
            Ok(trigger) => trigger,
            Err(e) => {
                error!(task = id, schedule, "invalid schedule format");
                return Err(e);
            }
        };

        let root = self.root.lock().await;
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(id) {
            warn!(task = id, "task already exists");
            return Err(OrchestratorError::conflict(format!("task {id} already exists")));
        }

        let mut entry = TaskEntry {
            id: id.to_string(),
            name: name.to_string(),
            schedule: schedule.to_string(),
            enabled,
            last_run: None,
            next_run: None,
            action,
            registration: None,
        };
        if let (true, Some(token)) = (enabled, root.as_ref()) {
            self.register(&mut entry, trigger, token);
        }
        tasks.insert(id.to_string(), entry);
        info!(task = id, name, schedule, "added task");
        Ok(())
    }

    /// Deregisters the trigger, then deletes the task.
    pub async fn remove_task(&self, id: &str) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let Some(mut entry) = tasks.remove(id) else {
            warn!(task = id, "task not found");
            return Err(OrchestratorError::not_found(format!("task {id}")));
        };
        entry.deregister();
        info!(task = id, name = %entry.name, "removed task");
        Ok(())
    }

    pub async fn enable_task(&self, id: &str) -> Result<()> {
        let root = self.root.lock().await;
        let mut tasks = self.tasks.write().await;
        let Some(entry) = tasks.get_mut(id) else {
            warn!(task = id, "task not found");
            return Err(OrchestratorError::not_found(format!("task {id}")));
        };
        if entry.enabled && (entry.registration.is_some() || root.is_none()) {
            return Ok(());
        }

        let trigger = match Trigger::parse(&entry.schedule) {
            Ok(trigger) => trigger,
            Err(e) => {
                error!(task = id, error = %e, "cannot enable task");
                return Err(e);
            }
        };
        entry.enabled = true;
        if let Some(token) = root.as_ref() {
            self.register(entry, trigger, token);
        }
        info!(task = id, "enabled task");
        Ok(())
    }

    /// Deregisters the trigger but keeps the task and its run history.
    pub async fn disable_task(&self, id: &str) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let Some(entry) = tasks.get_mut(id) else {
            warn!(task = id, "task not found");
            return Err(OrchestratorError::not_found(format!("task {id}")));
        };
        entry.enabled = false;
        entry.deregister();
        info!(task = id, "disabled task");
        Ok(())
    }

    pub async fn get_tasks(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self.tasks.read().await.values().map(TaskEntry::info).collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    pub async fn get_task(&self, id: &str) -> Option<TaskInfo> {
        self.tasks.read().await.get(id).map(TaskEntry::info)
    }

    /// Spawns the trigger loop for `entry`. Callers hold the task map's write
    /// lock, so the loop cannot observe the entry before it is registered.
    fn register(&self, entry: &mut TaskEntry, trigger: Trigger, root: &CancellationToken) {
        entry.deregister();

        let Some(first) = trigger.next_after(self.clock.now()) else {
            warn!(task = %entry.id, schedule = %entry.schedule, "schedule never fires");
            return;
        };
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let token = root.child_token();

        let handle = tokio::spawn(trigger_loop(TriggerLoop {
            tasks: self.tasks.clone(),
            id: entry.id.clone(),
            generation,
            trigger,
            action: entry.action.clone(),
            token: token.clone(),
            clock: self.clock,
            next: first,
        }));

        entry.next_run = Some(first);
        entry.registration = Some(Registration {
            token,
            handle,
            generation,
        });
    }
}

struct TriggerLoop {
    tasks: TaskMap,
    id: String,
    generation: u64,
    trigger: Trigger,
    action: Arc<dyn TaskAction>,
    token: CancellationToken,
    clock: Clock,
    next: DateTime<Utc>,
}

impl TriggerLoop {
    /// Applies `f` if this loop still owns the task's registration.
    async fn record(&self, f: impl FnOnce(&mut TaskEntry)) -> bool {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&self.id) {
            Some(entry)
                if entry
                    .registration
                    .as_ref()
                    .is_some_and(|r| r.generation == self.generation) =>
            {
                f(entry);
                true
            }
            _ => false,
        }
    }
}

async fn trigger_loop(mut state: TriggerLoop) {
    loop {
        while let Some(wait) = next_wait(state.clock.now(), state.next) {
            tokio::select! {
                _ = state.token.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let started = state.clock.now();
        if !state.record(|e| e.last_run = Some(started)).await {
            return;
        }

        info!(task = %state.id, "running scheduled task");
        match AssertUnwindSafe(state.action.run()).catch_unwind().await {
            Ok(Ok(())) => info!(task = %state.id, "scheduled task completed"),
            Ok(Err(e)) => error!(task = %state.id, error = %e, "scheduled task failed"),
            Err(_) => error!(task = %state.id, "scheduled task panicked"),
        }

        let after = state.next.max(state.clock.now());
        let Some(next) = state.trigger.next_after(after) else {
            state.record(|e| e.next_run = None).await;
            warn!(task = %state.id, "schedule has no further occurrences");
            return;
        };
        state.next = next;
        if !state.record(|e| e.next_run = Some(next)).await {
            return;
        }
    }
}
