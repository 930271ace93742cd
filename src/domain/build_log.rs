//! Live build logs: every in-flight build keeps an append-only buffer and a broadcast channel so a
//! subscriber joining late still sees the whole log.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};

use futures::{future, Stream, StreamExt};
use log::debug;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const LIVE_CAPACITY: usize = 1024;

struct BuildLog {
    generation: u64,
    lines: Vec<String>,
    sender: broadcast::Sender<String>,
}

pub struct BuildLogSubscription {
    /// Lines published before the subscription.
    pub replay: Vec<String>,
    /// Lines published afterwards; closed once the build is finished.
    pub live: broadcast::Receiver<String>,
}

impl BuildLogSubscription {
    /// Replayed lines then live ones, ending with the build. Lines a slow reader lagged behind on
    /// are skipped.
    pub fn into_lines(self) -> impl Stream<Item = String> + Send + 'static {
        let live = BroadcastStream::new(self.live).filter_map(|line| {
            if let Err(e) = &line {
                debug!("Build log reader fell behind: {}", e);
            }
            future::ready(line.ok())
        });
        futures::stream::iter(self.replay).chain(live)
    }
}

#[derive(Default)]
pub struct BuildLogHub {
    builds: Mutex<HashMap<String, BuildLog>>,
    generations: AtomicU64,
}

impl BuildLogHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn builds(&self) -> MutexGuard<'_, HashMap<String, BuildLog>> {
        self.builds.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens a fresh log for `app_id`, replacing any previous one. The returned generation
    /// identifies this log when finishing it.
    pub fn begin(&self, app_id: &str) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, _) = broadcast::channel(LIVE_CAPACITY);
        self.builds().insert(
            app_id.to_string(),
            BuildLog {
                generation,
                lines: Vec::new(),
                sender,
            },
        );
        generation
    }

    pub fn publish(&self, app_id: &str, line: &str) {
        if let Some(log) = self.builds().get_mut(app_id) {
            log.lines.push(line.to_string());
            // no live subscriber is fine
            let _ = log.sender.send(line.to_string());
        }
    }

    /// `None` when no build is in flight for the app.
    pub fn subscribe(&self, app_id: &str) -> Option<BuildLogSubscription> {
        self.builds().get(app_id).map(|log| BuildLogSubscription {
            replay: log.lines.clone(),
            live: log.sender.subscribe(),
        })
    }

    /// Closes the log of `app_id` if it still belongs to `generation`.
    pub fn finish(&self, app_id: &str, generation: u64) {
        let mut builds = self.builds();
        if builds.get(app_id).map(|log| log.generation) == Some(generation) {
            builds.remove(app_id);
        }
    }
}
