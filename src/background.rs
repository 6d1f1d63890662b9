//! Background maintenance.
//!
//! One thread per engine keeps the group pool topped up, compacts sparse
//! groups and checkpoints the journal once it grows past the threshold.

use crate::engine::EngineShared;
use crate::error::Result;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Settings of the maintenance thread.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackgroundConfig {
    /// Time between two maintenance rounds.
    pub interval: Duration,

    /// Normal groups with free slots to keep per size class.
    pub min_remain_groups: usize,
    pub max_remain_groups: usize,
    /// Groups created per round at most.
    pub allocate_batch: usize,

    pub min_remain_ultra_groups: usize,
    pub max_remain_ultra_groups: usize,
    pub allocate_ultra_batch: usize,

    /// Run compaction each round.
    pub compaction: bool,
    /// Free bytes a group may hold before it is compacted.
    pub max_reserved: u64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            min_remain_groups: 1,
            max_remain_groups: 2,
            allocate_batch: 4,
            min_remain_ultra_groups: 0,
            max_remain_ultra_groups: 1,
            allocate_ultra_batch: 1,
            compaction: true,
            max_reserved: 64 * 1024 * 1024,
        }
    }
}

enum Command {
    Wake,
    Shutdown,
}

/// Handle to the maintenance thread. The thread holds only a weak reference
/// to the engine and exits on its own once the engine is gone.
pub(crate) struct BackgroundWorker {
    sender: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    pub(crate) fn start(shared: &Arc<EngineShared>, config: BackgroundConfig) -> Self {
        let (sender, receiver) = bounded(1);
        let engine = Arc::downgrade(shared);
        let handle = thread::Builder::new()
            .name("chunk-engine-bg".into())
            .spawn(move || run(engine, receiver, config));

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn background worker");
                None
            }
        };
        Self { sender, handle }
    }

    /// Run a round now instead of at the next tick.
    pub(crate) fn wake(&self) {
        let _ = self.sender.try_send(Command::Wake);
    }

    pub(crate) fn stop(mut self) {
        let _ = self.sender.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("background worker panicked");
            }
        }
    }
}

fn run(engine: Weak<EngineShared>, receiver: Receiver<Command>, config: BackgroundConfig) {
    tracing::debug!(interval = ?config.interval, "background worker started");
    loop {
        match receiver.recv_timeout(config.interval) {
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(Command::Wake) | Err(RecvTimeoutError::Timeout) => {}
        }

        let Some(shared) = engine.upgrade() else {
            break;
        };
        if shared.groups.is_quitting() {
            break;
        }
        if let Err(e) = run_once(&shared, &config) {
            tracing::warn!(error = %e, "background round failed");
        }
    }
    tracing::debug!("background worker stopped");
}

/// One maintenance round.
pub(crate) fn run_once(shared: &EngineShared, config: &BackgroundConfig) -> Result<()> {
    let created = shared.groups.allocate_groups(
        config.min_remain_groups,
        config.max_remain_groups,
        config.allocate_batch,
    )?;
    let created_ultra = shared.groups.allocate_ultra_groups(
        config.min_remain_ultra_groups,
        config.max_remain_ultra_groups,
        config.allocate_ultra_batch,
    )?;
    if created + created_ultra > 0 {
        tracing::debug!(created, created_ultra, "topped up group pool");
    }

    if config.compaction && !shared.groups.is_quitting() {
        shared.compact_groups(config.max_reserved)?;
    }
    shared.checkpoint_if_needed()?;
    Ok(())
}
