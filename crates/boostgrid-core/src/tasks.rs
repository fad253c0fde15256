//! Shutdown-aware handle for background loops.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Owns a set of spawned periodic loops and the signal that stops them.
///
/// Loops receive a `watch::Receiver<bool>` from [`BackgroundTasks::shutdown_signal`]
/// and exit when it changes.
pub struct BackgroundTasks {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// A receiver to hand to a loop before spawning it.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Track a spawned loop under a name used in logs.
    pub fn push(&mut self, name: &'static str, handle: JoinHandle<()>) {
        debug!(task = name, "background task started");
        self.handles.push((name, handle));
    }

    /// Names of the tracked loops, in spawn order.
    pub fn names(&self) -> Vec<&'static str> {
        self.handles.iter().map(|(name, _)| *name).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every loop to stop and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(task = name, error = %e, "background task panicked");
            }
        }
        info!("background tasks stopped");
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}
