// src/utils/streams.rs
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use log::debug;
use tokio::sync::mpsc;


/// Stable per-sample identifier, derived once at discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SampleKey(String);

impl SampleKey {
    pub fn new(key: impl Into<String>) -> Self {
        SampleKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the key can name a single directory under a stage dir:
    /// not empty, not `.` or `..`, and free of path separators.
    pub fn is_path_safe(&self) -> bool {
        !matches!(self.0.as_str(), "" | "." | "..") && !self.0.contains(['/', '\\'])
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SampleKey {
    fn from(key: &str) -> Self {
        SampleKey(key.to_string())
    }
}


/// Named artifact handles for one sample. The engine never opens these paths.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Artifacts(BTreeMap<String, PathBuf>);

impl Artifacts {
    pub fn new() -> Self {
        Artifacts(BTreeMap::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.0.insert(name.into(), path.into());
    }

    pub fn get(&self, name: &str) -> Option<&Path> {
        self.0.get(name).map(PathBuf::as_path)
    }

    /// Like `get`, but a missing artifact is an error naming it.
    pub fn require(&self, name: &str) -> Result<&Path> {
        self.get(name)
            .ok_or_else(|| anyhow!("Missing artifact '{}'", name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Projects onto `names`, failing on the first one absent.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Artifacts> {
        let mut selected = Artifacts::new();
        for name in names {
            let name = name.as_ref();
            selected.insert(name, self.require(name)?);
        }
        Ok(selected)
    }

    /// Adds every artifact of `other` whose name is not already present.
    pub fn absorb(&mut self, other: Artifacts) {
        for (name, path) in other.0 {
            self.0.entry(name).or_insert(path);
        }
    }
}

impl<N: Into<String>, P: Into<PathBuf>> FromIterator<(N, P)> for Artifacts {
    fn from_iter<I: IntoIterator<Item = (N, P)>>(iter: I) -> Self {
        let mut artifacts = Artifacts::new();
        for (name, path) in iter {
            artifacts.insert(name, path);
        }
        artifacts
    }
}


/// The unit carried between stages.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    pub key: SampleKey,
    pub artifacts: Artifacts,
}

impl Tuple {
    pub fn new(key: SampleKey, artifacts: Artifacts) -> Self {
        Tuple { key, artifacts }
    }
}

pub type TupleReceiver = mpsc::Receiver<Tuple>;


struct ChannelState {
    outlets: Vec<mpsc::Sender<Tuple>>,
    sealed: bool,
    closed: bool,
}

struct ChannelInner {
    name: String,
    capacity: usize,
    state: Mutex<ChannelState>,
}

/// Multi-consumer tuple stream. Every subscriber gets its own bounded queue
/// and sees every tuple sent, so several subscribers make a tee.
///
/// All subscriptions must happen before the first `send`. Sending after
/// `close` is a wiring bug and panics.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Channel {
            inner: Arc::new(ChannelInner {
                name: name.into(),
                capacity: capacity.max(1),
                state: Mutex::new(ChannelState {
                    outlets: Vec::new(),
                    sealed: false,
                    closed: false,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new consumer.
    ///
    /// # Returns
    /// Receiver yielding every tuple sent from now on; `None` marks end of stream.
    pub fn subscribe(&self) -> TupleReceiver {
        let mut state = self.state();
        let late = state.sealed || state.closed;
        if !late {
            let (tx, rx) = mpsc::channel(self.inner.capacity);
            state.outlets.push(tx);
            return rx;
        }
        drop(state);
        panic!("subscribe on channel '{}' after it started sending", self.inner.name);
    }

    /// Fan-out: `n` independent consumer streams over this channel.
    pub fn tee(&self, n: usize) -> Vec<TupleReceiver> {
        (0..n).map(|_| self.subscribe()).collect()
    }

    pub fn consumer_count(&self) -> usize {
        self.state().outlets.len()
    }

    /// Delivers `tuple` to every subscriber, waiting on full queues.
    /// The last subscriber receives the original; the others get clones.
    pub async fn send(&self, tuple: Tuple) {
        let outlets = {
            let mut state = self.state();
            if state.closed {
                drop(state);
                panic!("send on closed channel '{}' (key {})", self.inner.name, tuple.key);
            }
            state.sealed = true;
            state.outlets.clone()
        };

        let Some((last, rest)) = outlets.split_last() else {
            debug!("Channel '{}' has no consumers; dropping {}", self.inner.name, tuple.key);
            return;
        };
        for outlet in rest {
            if outlet.send(tuple.clone()).await.is_err() {
                debug!("A consumer of '{}' went away before {}", self.inner.name, tuple.key);
            }
        }
        if let Err(e) = last.send(tuple).await {
            debug!("A consumer of '{}' went away before {}", self.inner.name, e.0.key);
        }
    }

    /// Signals end of stream. Consumers drain what is queued, then see `None`.
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.sealed = true;
        state.outlets.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}
