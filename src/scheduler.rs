//! Leader-gated periodic tasks.
//!
//! A fleet may run one scheduler per instance; the KV lease elects exactly
//! one leader, and only the leader drives the task bodies. Tasks are
//! created stopped: their next-fire times are armed when leadership is
//! acquired and disarmed when it is lost, so a follower promoted mid-window
//! does not replay fires it never owned.
//!
//! Two tasks ship with the core: the retention cleanup
//! (`purge_deleted_intents`) and the escalation timeout sweep.

use std::{str::FromStr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    config::SchedulerConfig,
    errors::{CoreError, CoreResult},
    kv::LeaderElector,
    service::{EscalationService, IntentService},
    time::Clock,
};

struct CronTask {
    name: &'static str,
    schedule: Schedule,
    /// Armed only while this instance leads.
    next: Option<DateTime<Utc>>,
}

impl CronTask {
    fn new(name: &'static str, expression: &str) -> CoreResult<Self> {
        let schedule = Schedule::from_str(expression).map_err(|e| {
            CoreError::Validation(format!("invalid cron expression for {name}: {e}"))
        })?;
        Ok(Self {
            name,
            schedule,
            next: None,
        })
    }

    fn arm(&mut self, now: DateTime<Utc>) {
        if self.next.is_none() {
            self.next = self.schedule.after(&now).next();
            if let Some(next) = self.next {
                tracing::debug!(task = self.name, fire_at = %next, "task armed");
            }
        }
    }

    fn disarm(&mut self) {
        self.next = None;
    }

    fn due(&self, now: DateTime<Utc>) -> bool {
        self.next.is_some_and(|next| now >= next)
    }

    fn advance(&mut self, now: DateTime<Utc>) {
        self.next = self.schedule.after(&now).next();
    }
}

/// Cron driver for the cleanup and timeout-sweep tasks.
pub struct Scheduler {
    elector: Arc<LeaderElector>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    intents: Arc<IntentService>,
    escalations: Arc<EscalationService>,
    shutdown: watch::Sender<bool>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        elector: Arc<LeaderElector>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
        intents: Arc<IntentService>,
        escalations: Arc<EscalationService>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            elector,
            clock,
            config,
            intents,
            escalations,
            shutdown,
            handle: std::sync::Mutex::new(None),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.elector.is_leader()
    }

    /// Spawn the scheduler loop. Cron expressions are validated before the
    /// task starts, so a bad config fails fast at boot.
    pub fn start(&self) -> CoreResult<()> {
        let mut tasks = vec![
            CronTask::new("cleanup", &self.config.cleanup_cron)?,
            CronTask::new("timeout-sweep", &self.config.sweep_cron)?,
        ];

        let elector = Arc::clone(&self.elector);
        let clock = Arc::clone(&self.clock);
        let intents = Arc::clone(&self.intents);
        let escalations = Arc::clone(&self.escalations);
        let retention_days = self.config.retention_days;
        let heartbeat = Duration::from_secs(self.config.heartbeat_secs.max(1));
        let mut shutdown = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(heartbeat) => {
                        let leading = match elector.try_acquire().await {
                            Ok(leading) => leading,
                            Err(err) => {
                                tracing::warn!(error = %err, "leader probe failed");
                                false
                            }
                        };
                        if !leading {
                            for task in &mut tasks {
                                task.disarm();
                            }
                            continue;
                        }

                        let now = clock.now();
                        for task in &mut tasks {
                            task.arm(now);
                            if !task.due(now) {
                                continue;
                            }
                            match task.name {
                                "cleanup" => {
                                    if let Err(err) = intents.purge_deleted(retention_days).await {
                                        tracing::error!(error = %err, "retention cleanup failed");
                                    }
                                }
                                "timeout-sweep" => {
                                    match escalations.process_timeouts().await {
                                        Ok(processed) if !processed.is_empty() => {
                                            tracing::info!(count = processed.len(), "timeout sweep transitioned escalations");
                                        }
                                        Ok(_) => {}
                                        Err(err) => {
                                            tracing::error!(error = %err, "timeout sweep failed");
                                        }
                                    }
                                }
                                other => {
                                    tracing::error!(task = other, "unknown scheduled task");
                                }
                            }
                            task.advance(clock.now());
                        }
                    }
                }
            }
            tracing::debug!("scheduler loop stopped");
        });

        *self.handle.lock().expect("scheduler poisoned") = Some(handle);
        Ok(())
    }

    /// Stop the loop and give up the leadership lease.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().expect("scheduler poisoned").take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "scheduler task join failed");
            }
        }
        if let Err(err) = self.elector.resign().await {
            tracing::warn!(error = %err, "leadership resign failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cron_expressions_parse() {
        let config = SchedulerConfig::default();
        assert!(Schedule::from_str(&config.cleanup_cron).is_ok());
        assert!(Schedule::from_str(&config.sweep_cron).is_ok());
    }

    #[test]
    fn test_tasks_arm_and_fire_in_order() {
        let mut task = CronTask::new("timeout-sweep", "0 */5 * * * *").expect("cron");
        let now = Utc::now();

        assert!(!task.due(now), "stopped until armed");
        task.arm(now);
        let next = task.next.expect("armed");
        assert!(next > now);
        assert!(task.due(next), "fires at its schedule");

        task.advance(next);
        let following = task.next.expect("rearmed");
        assert!(following > next);
    }
}
