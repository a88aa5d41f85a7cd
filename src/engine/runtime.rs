// Runtime assembly and background task lifecycle

//! # Canvas Runtime
//!
//! [`CanvasRuntime`] builds every engine component from a [`RuntimeConfig`] and wires them
//! together:
//!
//! ```text
//!   RuleEngine ──┐
//!                ├─> EventDispatcher <── trigger actions (ActionExecutor)
//!   Telemetry ───┘         ▲
//!                          ├── StateMachineManager (entry/exit actions)
//!                          └── TimeTriggerScheduler (trigger actions)
//!
//!   LockManager ─┬─> CollaborationService ──> BroadcastRegistry ──> clients
//!   CanvasState ─┘
//! ```
//!
//! Construction never spawns anything. [`CanvasRuntime::start`] spawns the two background
//! loops (trigger scheduler and lock sweep) on the current tokio runtime and
//! [`CanvasRuntime::shutdown`] stops them. A loop iteration that has begun always finishes
//! before its task exits.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::engine::actions::{ActionExecutor, Simulator};
use crate::engine::broadcast::BroadcastRegistry;
use crate::engine::canvas::{CanvasStateStore, DEFAULT_HISTORY_LIMIT};
use crate::engine::clock::{Clock, SystemClock};
use crate::engine::collaboration::CollaborationService;
use crate::engine::conditions::EvaluationContext;
use crate::engine::events::{DispatchReport, EventDispatcher};
use crate::engine::locks::LockManager;
use crate::engine::rules::RuleEngine;
use crate::engine::scheduler::TimeTriggerScheduler;
use crate::engine::states::{StateMachineManager, TransitionOutcome};
use crate::engine::telemetry::{Telemetry, TracingTelemetry};
use crate::models::Definitions;
use crate::{CanvasRuntimeError, Result};

struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Every engine component, wired together
pub struct CanvasRuntime {
    config: RuntimeConfig,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn Telemetry>,
    rules: Arc<RuleEngine>,
    executor: Arc<ActionExecutor>,
    states: Arc<StateMachineManager>,
    dispatcher: Arc<EventDispatcher>,
    scheduler: Arc<TimeTriggerScheduler>,
    collaboration: CollaborationService,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl CanvasRuntime {
    /// Runtime on the system clock, logging telemetry through `tracing`
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_parts(config, Arc::new(SystemClock), Arc::new(TracingTelemetry), None)
    }

    pub fn with_parts(
        config: RuntimeConfig,
        clock: Arc<dyn Clock>,
        telemetry: Arc<dyn Telemetry>,
        simulator: Option<Arc<dyn Simulator>>,
    ) -> Self {
        let rules = Arc::new(RuleEngine::new());

        let mut executor = ActionExecutor::new(telemetry.clone(), config.max_trigger_depth);
        if let Some(simulator) = simulator {
            executor = executor.with_simulator(simulator);
        }
        let executor = Arc::new(executor);

        let dispatcher = Arc::new(EventDispatcher::new(
            rules.clone(),
            executor.clone(),
            clock.clone(),
            telemetry.clone(),
            config.event_history_capacity,
        ));
        let states = Arc::new(StateMachineManager::new(executor.clone(), clock.clone()));
        let scheduler = Arc::new(
            TimeTriggerScheduler::new(executor.clone(), clock.clone()).with_event_sink(dispatcher.clone()),
        );

        let locks = Arc::new(LockManager::new(
            config.lock_timeout_seconds,
            clock.clone(),
            telemetry.clone(),
        ));
        let collaboration = CollaborationService::new(
            locks,
            Arc::new(BroadcastRegistry::new(config.client_buffer_capacity, clock.clone())),
            Arc::new(CanvasStateStore::new(DEFAULT_HISTORY_LIMIT)),
        );

        Self {
            config,
            clock,
            telemetry,
            rules,
            executor,
            states,
            dispatcher,
            scheduler,
            collaboration,
            tasks: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn telemetry(&self) -> &Arc<dyn Telemetry> {
        &self.telemetry
    }

    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    pub fn states(&self) -> &StateMachineManager {
        &self.states
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &Arc<TimeTriggerScheduler> {
        &self.scheduler
    }

    pub fn collaboration(&self) -> &CollaborationService {
        &self.collaboration
    }

    /// Dispatch an element event
    pub fn dispatch(&self, element_id: &str, event_type: &str, event_data: Value) -> DispatchReport {
        self.dispatcher.dispatch(element_id, event_type, event_data)
    }

    /// Transition an element's state machine; trigger actions feed the dispatcher
    pub fn transition(
        &self,
        element_id: &str,
        target_state: &str,
        context: Option<&EvaluationContext>,
    ) -> TransitionOutcome {
        self.states
            .execute_transition(element_id, target_state, context, Some(self.dispatcher.as_ref()))
    }

    /// Register every rule, trigger and state machine of a definitions document
    ///
    /// Stops at the first entry that fails to register; entries before it stay installed.
    pub fn install(&self, definitions: Definitions) -> Result<()> {
        let (rules, triggers, machines) = (
            definitions.rules.len(),
            definitions.triggers.len(),
            definitions.state_machines.len(),
        );
        for rule in definitions.rules {
            self.rules.register_rule(rule)?;
        }
        for trigger in definitions.triggers {
            self.scheduler.register_time_trigger(trigger)?;
        }
        for machine in definitions.state_machines {
            self.states
                .register_state_machine(&machine.element_id, machine.states, &machine.initial_state)?;
        }
        info!(rules, triggers, state_machines = machines, "definitions installed");
        Ok(())
    }

    /// Spawn the scheduler and lock sweep loops on the current tokio runtime
    ///
    /// Starting a runtime that is already running is a no-op.
    pub fn start(&self) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            CanvasRuntimeError::Internal(format!("runtime must be started inside tokio: {}", e))
        })?;

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.is_some() {
            warn!("canvas runtime already running");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let scheduler = handle.spawn(
            self.scheduler
                .clone()
                .run(self.config.scheduler_poll_interval(), cancel.clone()),
        );
        let sweep = handle.spawn(run_lock_sweep(
            self.collaboration.clone(),
            self.config.lock_sweep_interval(),
            cancel.clone(),
        ));

        *tasks = Some(BackgroundTasks {
            cancel,
            handles: vec![scheduler, sweep],
        });
        info!(
            lock_timeout_seconds = self.config.lock_timeout_seconds,
            sweep_interval_seconds = self.config.lock_sweep_interval_seconds,
            "canvas runtime started"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop the background loops and wait for them to finish their current pass
    pub async fn shutdown(&self) {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(tasks) = tasks else {
            debug!("canvas runtime not running, nothing to shut down");
            return;
        };

        tasks.cancel.cancel();
        for handle in tasks.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "background task ended abnormally");
            }
        }
        let closed = self.collaboration.registry().close_all();
        info!(closed_clients = closed, "canvas runtime stopped");
    }
}

/// Remove expired locks on a fixed interval until cancelled
async fn run_lock_sweep(collaboration: CollaborationService, every: Duration, cancel: CancellationToken) {
    info!(interval_seconds = every.as_secs(), "lock sweep started");
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("lock sweep stopping");
                break;
            }
            _ = interval.tick() => {
                let expired = collaboration.sweep_expired();
                if !expired.is_empty() {
                    debug!(expired = expired.len(), "lock sweep pass");
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
    use crate::models::{Action, BehaviorState, Schedule, StateCategory, StateTransition, TimeTrigger};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn runtime() -> (CanvasRuntime, Arc<ManualClock>, Arc<InMemoryTelemetry>) {
        let clock = Arc::new(ManualClock::starting_now());
        let telemetry = Arc::new(InMemoryTelemetry::new());
        let config = RuntimeConfig {
            lock_timeout_seconds: 5,
            scheduler_poll_interval_ms: 10,
            ..RuntimeConfig::default()
        };
        let runtime = CanvasRuntime::with_parts(config, clock.clone(), telemetry.clone(), None);
        (runtime, clock, telemetry)
    }

    #[test]
    fn test_start_requires_tokio() {
        let (runtime, _, _) = runtime();
        assert!(runtime.start().is_err());
        assert!(!runtime.is_running());
    }

    #[test]
    fn test_shutdown_without_start_is_noop() {
        let (runtime, _, _) = runtime();
        let registration = runtime.collaboration().registry().register_client("c1", "alice", "s1");
        tokio_test::block_on(runtime.shutdown());
        // Clients stay registered when there was nothing to stop
        assert_eq!(runtime.collaboration().registry().client_count(), 1);
        drop(registration);
    }

    #[test]
    fn test_transition_actions_reach_dispatcher() {
        let (runtime, _, _) = runtime();
        runtime
            .states()
            .register_state_machine(
                "fan-2",
                vec![
                    BehaviorState::new("idle", StateCategory::Equipment)
                        .with_transition(StateTransition::to("running")),
                    BehaviorState::new("running", StateCategory::Equipment).with_entry_action(
                        Action::trigger(None, "operational_event", json!({"state": "running"})),
                    ),
                ],
                "idle",
            )
            .unwrap();

        let outcome = runtime.transition("fan-2", "running", None);
        assert!(outcome.is_completed());

        let history = runtime.dispatcher().history_for("fan-2");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_data["state"], json!("running"));
    }

    #[test]
    fn test_install_definitions() {
        let (runtime, _, _) = runtime();
        let definitions = Definitions::from_json(
            r#"{
                "rules": [{"id": "r1", "type": "operational", "conditions": [], "actions": []}],
                "triggers": [{"id": "t1", "schedule_type": "cyclic", "schedule_data": {"interval_seconds": 60}}],
                "state_machines": [{"element_id": "pump-1", "initial_state": "off",
                                    "states": [{"id": "off", "category": "equipment"}]}]
            }"#,
        )
        .unwrap();

        runtime.install(definitions).unwrap();
        assert_eq!(runtime.rules().rule_count(), 1);
        assert!(runtime.scheduler().get_time_trigger("t1").is_some());
        assert_eq!(runtime.states().get_element_state("pump-1").map(|s| s.to_string()), Some("off".to_string()));
    }

    #[tokio::test]
    async fn test_sweep_loop_expires_locks() {
        let (runtime, clock, _) = runtime();
        let collaboration = runtime.collaboration();
        let mut watcher = collaboration.connect("canvas1", "carol", "C");
        collaboration.lock("canvas1", "obj1", "A", "alice");
        assert_eq!(watcher.receiver.recv().await.map(|m| m.status), Some("locked".to_string()));

        clock.advance(ChronoDuration::seconds(6));
        runtime.start().unwrap();
        assert!(runtime.is_running());

        // the first sweep runs as soon as the loop starts
        let pushed = tokio::time::timeout(Duration::from_secs(5), watcher.receiver.recv())
            .await
            .unwrap();
        assert_eq!(pushed.map(|m| m.status), Some("expired".to_string()));
        assert!(collaboration.all_locks(None).is_empty());

        runtime.shutdown().await;
        assert!(!runtime.is_running());
        // shutdown closes client channels
        assert!(watcher.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_scheduler_loop_fires_due_triggers() {
        let (runtime, clock, telemetry) = runtime();
        runtime
            .scheduler()
            .register_time_trigger(
                TimeTrigger::new("purge", Schedule::cyclic(60))
                    .for_element("ahu-1")
                    .with_action(Action::trigger(None, "system_event", json!({"purge": true}))),
            )
            .unwrap();
        runtime.scheduler().force_next_execution("purge", clock.now()).unwrap();

        runtime.start().unwrap();
        runtime.start().unwrap();

        let mut fired = false;
        for _ in 0..200 {
            if !runtime.dispatcher().history_for("ahu-1").is_empty() {
                fired = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        runtime.shutdown().await;

        assert!(fired);
        assert_eq!(telemetry.counter("event.system_event.handled"), 1);
        let trigger = runtime.scheduler().get_time_trigger("purge").unwrap();
        assert_eq!(trigger.next_execution, Some(clock.now() + ChronoDuration::seconds(60)));
    }
}
