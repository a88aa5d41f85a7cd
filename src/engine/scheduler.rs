// Time trigger scheduler

//! # Time Trigger Scheduler
//!
//! Holds the registered [`TimeTrigger`]s and fires the ones that are due. A call to
//! [`TimeTriggerScheduler::tick`] is one scheduler pass; [`TimeTriggerScheduler::run`] drives
//! ticks from a `tokio::time::interval` until its cancellation token fires.
//!
//! ## Per-Tick Behavior
//!
//! For each enabled trigger with `next_execution <= now`, in registration order:
//! 1. `last_execution` becomes `now`
//! 2. `next_execution` is recomputed from the schedule (see [`crate::models::Schedule`])
//! 3. the trigger's actions run through the action executor
//!
//! Bookkeeping happens under the trigger table lock; actions run after it is released, so an
//! action may register or toggle triggers without deadlocking. A failing action is recorded
//! in the fire report and never stops other actions or other triggers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::actions::{ActionExecutor, ActionOutcome, ActionScope, EventSink};
use crate::engine::clock::Clock;
use crate::engine::conditions::EvaluationContext;
use crate::models::{Action, TimeTrigger};
use crate::{CanvasRuntimeError, Result};

/// Report of one trigger fire
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerFire {
    pub trigger_id: String,
    pub fired_at: DateTime<Utc>,
    pub next_execution: Option<DateTime<Utc>>,
    pub outcomes: Vec<ActionOutcome>,
}

/// Scheduler for time-based triggers
pub struct TimeTriggerScheduler {
    triggers: Mutex<Vec<TimeTrigger>>,
    executor: Arc<ActionExecutor>,
    sink: Option<Arc<dyn EventSink>>,
    clock: Arc<dyn Clock>,
}

impl TimeTriggerScheduler {
    pub fn new(executor: Arc<ActionExecutor>, clock: Arc<dyn Clock>) -> Self {
        Self {
            triggers: Mutex::new(Vec::new()),
            executor,
            sink: None,
            clock,
        }
    }

    /// Route derived events of `trigger` actions to `sink`
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn table(&self) -> std::sync::MutexGuard<'_, Vec<TimeTrigger>> {
        self.triggers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register (or replace) a trigger
    ///
    /// When the trigger carries no `next_execution`, the first one is computed from its
    /// schedule. Disabled triggers keep `next_execution = None`.
    pub fn register_time_trigger(&self, mut trigger: TimeTrigger) -> Result<()> {
        if trigger.id.trim().is_empty() {
            return Err(CanvasRuntimeError::Validation(
                "trigger id must not be empty".to_string(),
            ));
        }
        trigger
            .schedule
            .validate()
            .map_err(|reason| CanvasRuntimeError::Validation(format!("trigger {}: {}", trigger.id, reason)))?;

        let now = self.clock.now();
        if !trigger.enabled {
            trigger.next_execution = None;
        } else if trigger.next_execution.is_none() {
            trigger.next_execution = trigger.schedule.first_execution(now);
        }

        info!(
            trigger_id = %trigger.id,
            schedule = trigger.schedule.kind(),
            next_execution = ?trigger.next_execution,
            "registered time trigger"
        );

        let mut triggers = self.table();
        match triggers.iter_mut().find(|t| t.id == trigger.id) {
            Some(existing) => *existing = trigger,
            None => triggers.push(trigger),
        }
        Ok(())
    }

    pub fn unregister_time_trigger(&self, trigger_id: &str) -> bool {
        let mut triggers = self.table();
        let before = triggers.len();
        triggers.retain(|t| t.id != trigger_id);
        triggers.len() != before
    }

    /// Enable or disable a trigger
    ///
    /// Disabling clears `next_execution`; enabling computes a fresh one from the schedule.
    pub fn set_trigger_enabled(&self, trigger_id: &str, enabled: bool) -> Result<()> {
        let now = self.clock.now();
        let mut triggers = self.table();
        let trigger = triggers
            .iter_mut()
            .find(|t| t.id == trigger_id)
            .ok_or_else(|| CanvasRuntimeError::not_found("trigger", trigger_id))?;

        if trigger.enabled != enabled {
            trigger.enabled = enabled;
            trigger.next_execution = if enabled {
                trigger.schedule.first_execution(now)
            } else {
                None
            };
        }
        Ok(())
    }

    /// Override the next execution instant of a trigger
    pub fn force_next_execution(&self, trigger_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut triggers = self.table();
        let trigger = triggers
            .iter_mut()
            .find(|t| t.id == trigger_id)
            .ok_or_else(|| CanvasRuntimeError::not_found("trigger", trigger_id))?;
        if !trigger.enabled {
            return Err(CanvasRuntimeError::Validation(format!(
                "trigger {} is disabled",
                trigger_id
            )));
        }
        trigger.next_execution = Some(at);
        Ok(())
    }

    pub fn get_time_trigger(&self, trigger_id: &str) -> Option<TimeTrigger> {
        self.table().iter().find(|t| t.id == trigger_id).cloned()
    }

    /// Snapshot of all triggers in registration order
    pub fn get_registered_time_triggers(&self) -> Vec<TimeTrigger> {
        self.table().clone()
    }

    /// Fire every trigger that is due at `now`
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<TriggerFire> {
        let due: Vec<(String, String, Vec<Action>, Option<DateTime<Utc>>)> = {
            let mut triggers = self.table();
            triggers
                .iter_mut()
                .filter(|t| t.is_due(now))
                .map(|t| {
                    t.last_execution = Some(now);
                    t.next_execution = t.schedule.advance(now);
                    (
                        t.id.clone(),
                        t.scope_element().to_string(),
                        t.actions.clone(),
                        t.next_execution,
                    )
                })
                .collect()
        };

        if due.is_empty() {
            return Vec::new();
        }

        let sink = self.sink.as_deref();
        due.into_iter()
            .map(|(trigger_id, element_id, actions, next_execution)| {
                info!(trigger_id = %trigger_id, next_execution = ?next_execution, "executing time trigger");
                let mut context = EvaluationContext::new(now)
                    .with("element_id", json!(element_id))
                    .with("trigger_id", json!(trigger_id));
                let outcomes = self.executor.execute(
                    &actions,
                    &ActionScope::new(&element_id),
                    &mut context,
                    sink,
                );
                let failed = outcomes.iter().filter(|o| !o.is_applied()).count();
                if failed > 0 {
                    warn!(trigger_id = %trigger_id, failed, "time trigger had failing actions");
                }
                TriggerFire {
                    trigger_id,
                    fired_at: now,
                    next_execution,
                    outcomes,
                }
            })
            .collect()
    }

    /// Tick on a fixed interval until `cancel` fires
    ///
    /// A tick that has started always completes before the loop stops.
    pub async fn run(self: Arc<Self>, poll_interval: Duration, cancel: CancellationToken) {
        info!(poll_interval_ms = poll_interval.as_millis() as u64, "time trigger scheduler started");
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("time trigger scheduler stopping");
                    break;
                }
                _ = interval.tick() => {
                    let fired = self.tick(self.clock.now());
                    if !fired.is_empty() {
                        debug!(fired = fired.len(), "scheduler pass fired triggers");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::clock::ManualClock;
    use crate::engine::telemetry::InMemoryTelemetry;
    use crate::models::trigger::MAX_PERIOD_SECONDS;
    use crate::models::Schedule;
    use chrono::Duration as ChronoDuration;

    fn scheduler() -> (Arc<TimeTriggerScheduler>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let executor = Arc::new(ActionExecutor::new(Arc::new(InMemoryTelemetry::new()), 4));
        (Arc::new(TimeTriggerScheduler::new(executor, clock.clone())), clock)
    }

    #[test]
    fn test_cyclic_trigger_advances_by_interval() {
        let (scheduler, clock) = scheduler();
        scheduler
            .register_time_trigger(TimeTrigger::new("hourly", Schedule::cyclic(3600)).with_action(Action::log("tick")))
            .unwrap();

        let now = clock.now();
        scheduler.force_next_execution("hourly", now).unwrap();
        let fired = scheduler.tick(now);

        assert_eq!(fired.len(), 1);
        let trigger = scheduler.get_time_trigger("hourly").unwrap();
        assert_eq!(trigger.last_execution, Some(now));
        assert_eq!(trigger.next_execution, Some(now + ChronoDuration::seconds(3600)));
    }

    #[test]
    fn test_only_due_triggers_fire() {
        let (scheduler, clock) = scheduler();
        scheduler.register_time_trigger(TimeTrigger::new("a", Schedule::cyclic(60))).unwrap();
        scheduler.register_time_trigger(TimeTrigger::new("b", Schedule::cyclic(600))).unwrap();

        clock.advance(ChronoDuration::seconds(61));
        let fired: Vec<String> = scheduler.tick(clock.now()).into_iter().map(|f| f.trigger_id).collect();
        assert_eq!(fired, vec!["a".to_string()]);

        assert!(scheduler.tick(clock.now()).is_empty());
    }

    #[test]
    fn test_disabled_trigger_never_fires() {
        let (scheduler, clock) = scheduler();
        scheduler.register_time_trigger(TimeTrigger::new("a", Schedule::cyclic(60))).unwrap();
        scheduler.set_trigger_enabled("a", false).unwrap();
        assert_eq!(scheduler.get_time_trigger("a").unwrap().next_execution, None);

        clock.advance(ChronoDuration::seconds(3600));
        assert!(scheduler.tick(clock.now()).is_empty());
        assert!(scheduler.force_next_execution("a", clock.now()).is_err());

        scheduler.set_trigger_enabled("a", true).unwrap();
        assert_eq!(
            scheduler.get_time_trigger("a").unwrap().next_execution,
            Some(clock.now() + ChronoDuration::seconds(60))
        );
    }

    #[test]
    fn test_failing_trigger_does_not_block_others() {
        let (scheduler, clock) = scheduler();
        let broken = TimeTrigger::new("broken", Schedule::cyclic(10))
            .with_action(Action::Physics { simulation: "flow".into(), data: serde_json::Value::Null });
        let healthy = TimeTrigger::new("healthy", Schedule::cyclic(10)).with_action(Action::log("ok"));
        scheduler.register_time_trigger(broken).unwrap();
        scheduler.register_time_trigger(healthy).unwrap();

        clock.advance(ChronoDuration::seconds(10));
        let fired = scheduler.tick(clock.now());

        assert_eq!(fired.len(), 2);
        assert!(!fired[0].outcomes[0].is_applied());
        assert!(fired[1].outcomes[0].is_applied());
    }

    #[test]
    fn test_delayed_trigger_fires_once() {
        let (scheduler, clock) = scheduler();
        scheduler
            .register_time_trigger(TimeTrigger::new("once", Schedule::Delayed { delay_seconds: 5 }))
            .unwrap();

        clock.advance(ChronoDuration::seconds(5));
        assert_eq!(scheduler.tick(clock.now()).len(), 1);
        assert_eq!(scheduler.get_time_trigger("once").unwrap().next_execution, None);

        clock.advance(ChronoDuration::seconds(500));
        assert!(scheduler.tick(clock.now()).is_empty());
    }

    #[test]
    fn test_registration_validation_and_replacement() {
        let (scheduler, _) = scheduler();
        assert!(scheduler.register_time_trigger(TimeTrigger::new("bad", Schedule::cyclic(0))).is_err());
        assert!(matches!(
            scheduler.force_next_execution("missing", Utc::now()),
            Err(CanvasRuntimeError::NotFound { kind: "trigger", .. })
        ));

        scheduler.register_time_trigger(TimeTrigger::new("t", Schedule::cyclic(60))).unwrap();
        scheduler.register_time_trigger(TimeTrigger::new("t", Schedule::cyclic(120))).unwrap();
        let triggers = scheduler.get_registered_time_triggers();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].schedule, Schedule::cyclic(120));

        assert!(scheduler.unregister_time_trigger("t"));
        assert!(scheduler.get_registered_time_triggers().is_empty());
    }

    #[test]
    fn test_oversized_or_unrepresentable_periods_do_not_panic() {
        let (scheduler, _) = scheduler();
        assert!(matches!(
            scheduler.register_time_trigger(TimeTrigger::new("huge", Schedule::cyclic(10_000_000_000_000))),
            Err(CanvasRuntimeError::Validation(_))
        ));

        scheduler
            .register_time_trigger(TimeTrigger::new("decade", Schedule::cyclic(MAX_PERIOD_SECONDS)))
            .unwrap();
        scheduler.register_time_trigger(TimeTrigger::new("minute", Schedule::cyclic(60))).unwrap();

        let near_end = DateTime::<Utc>::MAX_UTC - ChronoDuration::days(1);
        scheduler.force_next_execution("decade", near_end).unwrap();
        scheduler.force_next_execution("minute", near_end).unwrap();
        let fired = scheduler.tick(near_end);

        assert_eq!(fired.len(), 2);
        assert_eq!(scheduler.get_time_trigger("decade").unwrap().next_execution, None);
        assert_eq!(
            scheduler.get_time_trigger("minute").unwrap().next_execution,
            Some(near_end + ChronoDuration::seconds(60))
        );
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_cancel() {
        let (scheduler, clock) = scheduler();
        scheduler.register_time_trigger(TimeTrigger::new("t", Schedule::cyclic(1))).unwrap();
        scheduler.force_next_execution("t", clock.now()).unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.clone().run(std::time::Duration::from_millis(5), cancel.clone()));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(scheduler.get_time_trigger("t").unwrap().last_execution.is_some());
    }
}
