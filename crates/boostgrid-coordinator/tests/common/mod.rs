//! Scripted collaborators for coordinator integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use boostgrid_coordinator::{Coordinator, Providers};
use boostgrid_core::{
    BoostConfig, BoostEvent, BoosterProvider, BoxFuture, ExecutionError, ExecutionOutput,
    GeneralProvider, InstanceDriver, InstanceHandle, InstanceProfile, Target, Task, TaskRouter,
    EVENTS_CHANNEL,
};
use boostgrid_store::StateStore;

/// Routes every task to a fixed target, after failing `failures` times.
pub struct ScriptedRouter {
    target: Target,
    failures: AtomicU32,
    pub calls: AtomicU32,
}

impl ScriptedRouter {
    pub fn to(target: Target) -> Self {
        Self {
            target,
            failures: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing_first(mut self, failures: u32) -> Self {
        self.failures = AtomicU32::new(failures);
        self
    }
}

impl TaskRouter for ScriptedRouter {
    fn route<'a>(&'a self, _task: &'a Task) -> BoxFuture<'a, Result<Target, String>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err("router unavailable".to_string());
            }
            Ok(self.target.clone())
        })
    }
}

/// Booster provider: pops scripted results, then succeeds. `fail_all` wins.
#[derive(Default)]
pub struct MockBooster {
    script: Mutex<VecDeque<ExecutionError>>,
    fail_all: Mutex<Option<ExecutionError>>,
    delay: Duration,
    pub calls: Mutex<Vec<String>>,
}

impl MockBooster {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_first(self, errors: Vec<ExecutionError>) -> Self {
        *self.script.lock().unwrap() = errors.into();
        self
    }

    pub fn always_failing(self, error: ExecutionError) -> Self {
        *self.fail_all.lock().unwrap() = Some(error);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl BoosterProvider for MockBooster {
    fn run_in_instance<'a>(
        &'a self,
        instance: &'a InstanceHandle,
        _task: &'a Task,
    ) -> BoxFuture<'a, Result<ExecutionOutput, ExecutionError>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(instance.id.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(err) = self.fail_all.lock().unwrap().clone() {
                return Err(err);
            }
            if let Some(err) = self.script.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(ExecutionOutput {
                data: serde_json::json!({ "instance": instance.id }),
                exec_time: self.delay,
            })
        })
    }
}

/// General provider that records the targets it was asked to run on.
#[derive(Default)]
pub struct MockGeneral {
    fail: Mutex<Option<ExecutionError>>,
    pub targets: Mutex<Vec<String>>,
}

impl MockGeneral {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failing(error: ExecutionError) -> Self {
        Self {
            fail: Mutex::new(Some(error)),
            targets: Mutex::new(Vec::new()),
        }
    }

    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().unwrap().clone()
    }
}

impl GeneralProvider for MockGeneral {
    fn run<'a>(
        &'a self,
        _task: &'a Task,
        target: &'a Target,
    ) -> BoxFuture<'a, Result<ExecutionOutput, ExecutionError>> {
        Box::pin(async move {
            self.targets.lock().unwrap().push(target.id.clone());
            if let Some(err) = self.fail.lock().unwrap().clone() {
                return Err(err);
            }
            Ok(ExecutionOutput {
                data: serde_json::json!({ "target": target.id }),
                exec_time: Duration::from_millis(5),
            })
        })
    }
}

/// Launches instantly, always healthy. `failing()` refuses every launch.
#[derive(Default)]
pub struct MockDriver {
    fail_launches: AtomicBool,
    pub terminated: Mutex<Vec<String>>,
}

impl MockDriver {
    pub fn failing() -> Self {
        Self {
            fail_launches: AtomicBool::new(true),
            ..Self::default()
        }
    }
}

impl InstanceDriver for MockDriver {
    fn launch<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, Result<InstanceProfile, String>> {
        Box::pin(async move {
            if self.fail_launches.load(Ordering::SeqCst) {
                return Err(format!("{instance_id}: no capacity"));
            }
            Ok(InstanceProfile::with_specializations(["rs", "ts"]))
        })
    }

    fn probe<'a>(&'a self, _instance_id: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async { true })
    }

    fn terminate<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.terminated.lock().unwrap().push(instance_id.to_string());
        })
    }
}

/// A small pool so queueing is easy to provoke.
pub fn test_config() -> BoostConfig {
    let mut config = BoostConfig::default();
    config.pool.min_pool_size = 1;
    config.pool.max_pool_size = 2;
    config
}

pub struct Harness {
    pub coordinator: Coordinator,
    pub store: StateStore,
    pub router: Arc<ScriptedRouter>,
    pub booster: Arc<MockBooster>,
    pub general: Arc<MockGeneral>,
    pub events: broadcast::Receiver<serde_json::Value>,
}

impl Harness {
    pub async fn new(
        config: BoostConfig,
        router: ScriptedRouter,
        booster: MockBooster,
        general: MockGeneral,
    ) -> Self {
        Self::with_driver(config, router, booster, general, MockDriver::default()).await
    }

    pub async fn with_driver(
        config: BoostConfig,
        router: ScriptedRouter,
        booster: MockBooster,
        general: MockGeneral,
        driver: MockDriver,
    ) -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let events = store.subscribe(EVENTS_CHANNEL);
        let router = Arc::new(router);
        let booster = Arc::new(booster);
        let general = Arc::new(general);
        let providers = Providers {
            router: router.clone(),
            booster: booster.clone(),
            general: general.clone(),
        };
        let coordinator = Coordinator::new(
            config,
            providers,
            Arc::new(driver),
            store.clone(),
        );
        coordinator.initialize().await.unwrap();
        Self {
            coordinator,
            store,
            router,
            booster,
            general,
            events,
        }
    }

    /// Booster-routed harness with default providers.
    pub async fn booster(booster: MockBooster) -> Self {
        Self::new(
            test_config(),
            ScriptedRouter::to(Target::booster("pool")),
            booster,
            MockGeneral::ok(),
        )
        .await
    }

    /// Drain buffered events.
    pub fn events(&mut self) -> Vec<BoostEvent> {
        let mut out = Vec::new();
        while let Ok(value) = self.events.try_recv() {
            out.push(serde_json::from_value(value).unwrap());
        }
        out
    }
}

pub fn names(events: &[BoostEvent]) -> Vec<&'static str> {
    events.iter().map(BoostEvent::name).collect()
}

pub fn rust_task() -> Task {
    Task::new("refactor").with_file_path("src/lib.rs")
}
