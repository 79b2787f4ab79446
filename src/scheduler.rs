use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::cron::CronExpression;
use crate::error::{AddError, SubmitError};
use crate::registry::HandleRegistry;
use crate::wheel::{Executor, HashedWheelTimer, TimerTask, Timeout};

/// Cron scheduler facade: parses expressions, computes delays, hands them to
/// the wheel, and re-arms each job after it fires.
///
/// Clones share the same scheduler. There is no process-wide instance; the
/// embedder constructs one and passes it around.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    wheel: HashedWheelTimer,
    registry: HandleRegistry,
}

impl Scheduler {
    pub fn new(tick: Duration, wheel_size: usize) -> Self {
        Scheduler {
            inner: Arc::new(SchedulerInner {
                wheel: HashedWheelTimer::new(tick, wheel_size),
                registry: HandleRegistry::new(),
            }),
        }
    }

    /// Fired bodies are handed to `executor` instead of running on the tick
    /// thread, so one slow job cannot delay the wheel.
    pub fn with_executor(tick: Duration, wheel_size: usize, executor: Arc<dyn Executor>) -> Self {
        Scheduler {
            inner: Arc::new(SchedulerInner {
                wheel: HashedWheelTimer::with_executor(tick, wheel_size, executor),
                registry: HandleRegistry::new(),
            }),
        }
    }

    /// Schedule `body` under `id` according to `cron` (evaluated in UTC).
    /// An existing job with the same id is cancelled and replaced.
    pub fn add<F>(&self, id: impl Into<String>, cron: &str, body: F) -> Result<(), AddError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let expression = CronExpression::parse(cron)?;
        self.add_expression(id, expression, body)
    }

    /// Like [`add`](Self::add), with a pre-parsed (possibly zoned) expression.
    pub fn add_expression<F>(
        &self,
        id: impl Into<String>,
        cron: CronExpression,
        body: F,
    ) -> Result<(), AddError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = id.into();
        let now = Utc::now();
        let next = cron.next_valid_after(now).ok_or(AddError::ExpressionExhausted)?;
        let delay = (next - now).to_std().unwrap_or_default();

        let job = Arc::new_cyclic(|this: &Weak<CronJob>| CronJob {
            id: id.clone(),
            cron,
            body: Box::new(body),
            scheduler: Arc::downgrade(&self.inner),
            this: this.clone(),
        });
        let handle = self.inner.wheel.submit(job, delay)?;
        if let Some(previous) = self.inner.registry.put(&id, handle) {
            previous.cancel();
        }
        info!(job = %id, next = %next, "job scheduled");
        Ok(())
    }

    /// Prevent the job from firing again. Idempotent: an unknown id counts
    /// as already cancelled and returns `true`. Returns `false` only when
    /// the stored handle had already fired or been cancelled directly.
    pub fn cancel(&self, id: &str) -> bool {
        match self.inner.registry.remove(id) {
            None => true,
            Some(handle) => handle.cancel(),
        }
    }

    /// Number of jobs currently registered.
    pub fn job_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.wheel.is_shutdown()
    }

    /// Stop the wheel and report the ids of jobs that were still waiting to
    /// fire. Jobs caught mid-body are not reported; they simply never re-arm.
    pub fn shutdown(&self) -> Vec<String> {
        self.inner.wheel.shutdown();
        let mut unfired: Vec<String> = self
            .inner
            .registry
            .drain()
            .into_iter()
            .filter(|(_, handle)| handle.is_pending())
            .map(|(id, _)| id)
            .collect();
        unfired.sort();
        info!(unfired = unfired.len(), "scheduler shut down");
        unfired
    }
}

/// One registered job. The wheel fires it, it runs the body, then submits
/// itself for the following cron instant.
struct CronJob {
    id: String,
    cron: CronExpression,
    body: Box<dyn Fn() + Send + Sync>,
    scheduler: Weak<SchedulerInner>,
    this: Weak<CronJob>,
}

impl TimerTask for CronJob {
    fn run(&self, timeout: &Timeout) {
        debug!(job = %self.id, "job fired");
        // A panicking body must not keep the job from re-arming.
        if panic::catch_unwind(AssertUnwindSafe(|| (self.body)())).is_err() {
            warn!(job = %self.id, "job body panicked");
        }
        if let (Some(scheduler), Some(job)) = (self.scheduler.upgrade(), self.this.upgrade()) {
            scheduler.rearm(job, timeout);
        }
    }
}

impl SchedulerInner {
    /// Submit `job` for its next instant, unless it was cancelled during the
    /// body or the wheel is gone.
    fn rearm(&self, job: Arc<CronJob>, fired: &Timeout) {
        let now = Utc::now();
        let Some(next) = job.cron.next_valid_after(now) else {
            info!(job = %job.id, "cron expression exhausted; job retired");
            self.registry.remove(&job.id);
            return;
        };
        let delay = (next - now).to_std().unwrap_or_default();
        let id = job.id.clone();
        match self.wheel.submit(job, delay) {
            Ok(handle) => {
                // Only re-install while the registry still points at the
                // handle that just fired; otherwise the job was cancelled or
                // replaced while the body ran.
                if self.registry.replace_if(&id, fired, handle.clone()) {
                    debug!(job = %id, next = %next, "job re-armed");
                } else {
                    handle.cancel();
                    debug!(job = %id, "job cancelled during body; not re-armed");
                }
            }
            Err(SubmitError::Shutdown) => {
                debug!(job = %id, "wheel shut down; job not re-armed");
            }
        }
    }
}
