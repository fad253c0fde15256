//! Test doubles shared by the pool's unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use boostgrid_core::{BoostEvent, BoxFuture, InstanceDriver, InstanceProfile};

/// Scripted instance driver. Launches pop queued profiles, then fall back to
/// an unspecialized one.
#[derive(Default)]
pub(crate) struct MockDriver {
    profiles: Mutex<VecDeque<InstanceProfile>>,
    unhealthy: Mutex<HashSet<String>>,
    fail_launches: AtomicBool,
    probes: AtomicUsize,
    probe_delay: Mutex<Duration>,
    terminated: Mutex<Vec<String>>,
}

impl MockDriver {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn with_profiles(profiles: Vec<InstanceProfile>) -> Arc<Self> {
        let driver = Self::default();
        *driver.profiles.lock().unwrap() = profiles.into();
        Arc::new(driver)
    }

    pub(crate) fn set_unhealthy(&self, instance_id: &str, unhealthy: bool) {
        let mut set = self.unhealthy.lock().unwrap();
        if unhealthy {
            set.insert(instance_id.to_string());
        } else {
            set.remove(instance_id);
        }
    }

    pub(crate) fn fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock().unwrap() = delay;
    }

    pub(crate) fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub(crate) fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }
}

impl InstanceDriver for MockDriver {
    fn launch<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, Result<InstanceProfile, String>> {
        Box::pin(async move {
            if self.fail_launches.load(Ordering::SeqCst) {
                return Err(format!("{instance_id}: no capacity"));
            }
            Ok(self.profiles.lock().unwrap().pop_front().unwrap_or_default())
        })
    }

    fn probe<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let delay = *self.probe_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            !self.unhealthy.lock().unwrap().contains(instance_id)
        })
    }

    fn terminate<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.terminated.lock().unwrap().push(instance_id.to_string());
        })
    }
}

/// Drain every event currently buffered on a subscription.
pub(crate) fn events(rx: &mut broadcast::Receiver<serde_json::Value>) -> Vec<BoostEvent> {
    let mut out = Vec::new();
    while let Ok(value) = rx.try_recv() {
        out.push(serde_json::from_value(value).unwrap());
    }
    out
}
