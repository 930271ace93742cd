//! Self-scheduled periodic work with an idempotent start/stop contract.

use std::{
    future::Future,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use log::{debug, info};
use tokio::{sync::watch, task::JoinHandle};

struct Running {
    shutdown: watch::Sender<bool>,
    _task: JoinHandle<()>,
}

pub struct PeriodicTask {
    name: &'static str,
    running: Mutex<Option<Running>>,
}

impl PeriodicTask {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `tick` immediately, then again `interval` after each completed tick.
    /// Returns false when the task was already running.
    pub fn start<F, Fut>(&self, interval: Duration, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running();
        if running.is_some() {
            return false;
        }
        let (shutdown, mut stopped) = watch::channel(false);
        let name = self.name;
        let task = tokio::spawn(async move {
            loop {
                tick().await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stopped.changed() => break,
                }
            }
            debug!("{} loop exited", name);
        });
        *running = Some(Running {
            shutdown,
            _task: task,
        });
        info!("{} started, every {:?}", name, interval);
        true
    }

    /// Halts future ticks; a tick already in flight runs to completion.
    /// Returns false when the task was not running.
    pub fn stop(&self) -> bool {
        match self.running().take() {
            Some(running) => {
                let _ = running.shutdown.send(true);
                info!("{} stopped", self.name);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}
