//! Keyed single-flight coordination.
//!
//! The first caller for a key becomes the leader and gets a [`FlightGuard`];
//! later callers join and receive a `watch` channel carrying the leader's
//! [`Progress`]. Joiners tail the temp file up to the published byte count
//! instead of waiting for the whole download.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::debug;

static FLIGHT_IDS: AtomicU64 = AtomicU64::new(0);

/// State of one in-flight download, as seen by joiners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Leader is connecting to upstream; nothing on disk yet.
    Starting,
    /// Bytes `0..readable` of `temp_path` are on disk and safe to read.
    Writing {
        temp_path: PathBuf,
        content_type: Option<String>,
        content_length: Option<u64>,
        readable: u64,
    },
    /// Renamed into place with `size` bytes.
    Done { size: u64 },
    Failed(String),
}

impl Progress {
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Failed(_))
    }
}

#[derive(Debug)]
struct Slot {
    id: u64,
    progress: watch::Receiver<Progress>,
}

/// Outcome of [`FlightMap::join`].
#[derive(Debug)]
pub enum Role {
    Leader(FlightGuard),
    Joiner(watch::Receiver<Progress>),
}

#[derive(Clone, Debug, Default)]
pub struct FlightMap {
    slots: Arc<DashMap<PathBuf, Slot>>,
}

impl FlightMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lead the flight for `key`, or follow the one already running.
    pub fn join(&self, key: &Path) -> Role {
        match self.slots.entry(key.to_path_buf()) {
            Entry::Occupied(slot) => {
                debug!("Joining in-flight download of {}", key.display());
                Role::Joiner(slot.get().progress.clone())
            }
            Entry::Vacant(vacant) => {
                let id = FLIGHT_IDS.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(Progress::Starting);
                vacant.insert(Slot { id, progress: rx });
                Role::Leader(FlightGuard {
                    slots: Arc::clone(&self.slots),
                    key: key.to_path_buf(),
                    id,
                    progress: tx,
                })
            }
        }
    }

    /// Number of keys with a flight running.
    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }
}

/// Leadership of one key. Dropping it unsettled reports the flight as failed.
#[derive(Debug)]
pub struct FlightGuard {
    slots: Arc<DashMap<PathBuf, Slot>>,
    key: PathBuf,
    id: u64,
    progress: watch::Sender<Progress>,
}

impl FlightGuard {
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    pub fn start(&self, temp_path: PathBuf, content_type: Option<String>, content_length: Option<u64>) {
        self.progress.send_replace(Progress::Writing {
            temp_path,
            content_type,
            content_length,
            readable: 0,
        });
    }

    pub fn advance(&self, readable: u64) {
        self.progress.send_if_modified(|p| match p {
            Progress::Writing { readable: r, .. } if *r != readable => {
                *r = readable;
                true
            }
            _ => false,
        });
    }

    pub fn finish(&self, size: u64) {
        self.settle(Progress::Done { size });
    }

    pub fn fail(&self, reason: impl Into<String>) {
        self.settle(Progress::Failed(reason.into()));
    }

    // The slot goes first so anyone woken by the outcome starts a fresh flight
    fn settle(&self, outcome: Progress) {
        self.slots.remove_if(&self.key, |_, slot| slot.id == self.id);
        self.progress.send_if_modified(|p| {
            if p.is_settled() {
                return false;
            }
            *p = outcome;
            true
        });
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.settle(Progress::Failed("download abandoned".to_string()));
    }
}
