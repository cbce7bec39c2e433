//! Join Engine: keyed fan-in of two or more upstream channels.
//!
//! Contributions are buffered per key until every upstream has reported that
//! key, then merged and emitted. Keys still incomplete when all upstreams
//! close are dropped (partial-join-drop): the missing contribution is the
//! downstream trace of a sample that already failed and was reported by its
//! stage, so it is logged at debug level only.

use std::collections::{HashMap, HashSet};

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use tokio_stream::wrappers::ReceiverStream;

use crate::utils::streams::{Artifacts, Channel, SampleKey, Tuple, TupleReceiver};


#[derive(Debug, Clone, PartialEq)]
pub struct JoinSpec {
    pub name: String,
    pub inputs: Vec<String>,
}

impl JoinSpec {
    pub fn new(name: impl Into<String>, inputs: &[&str]) -> Self {
        JoinSpec {
            name: name.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn arity(&self) -> usize {
        self.inputs.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct JoinReport {
    pub join: String,
    pub emitted: usize,
    pub dropped: Vec<SampleKey>,
}


/// Partial assembly for one key: one slot per upstream.
struct Partial {
    slots: Vec<Option<Artifacts>>,
    filled: usize,
}

/// Synchronous core of the join. `pending` holds only keys that are still
/// incomplete; `completed` remembers keys already emitted.
pub struct JoinBuffer {
    arity: usize,
    pending: HashMap<SampleKey, Partial>,
    completed: HashSet<SampleKey>,
}

impl JoinBuffer {
    pub fn new(arity: usize) -> Self {
        JoinBuffer {
            arity,
            pending: HashMap::new(),
            completed: HashSet::new(),
        }
    }

    /// Records `tuple` as upstream `slot`'s contribution for its key.
    ///
    /// # Returns
    /// The combined tuple when this arrival completes the key. Artifacts are
    /// merged in upstream order; on a name clash the earlier upstream wins.
    /// A second arrival for the same key on the same upstream is ignored,
    /// including one that comes after the key was emitted.
    pub fn offer(&mut self, slot: usize, tuple: Tuple) -> Option<Tuple> {
        let Tuple { key, artifacts } = tuple;
        let arity = self.arity;
        if slot >= arity {
            warn!("Upstream index {} out of range for arity {}", slot, arity);
            return None;
        }
        if self.completed.contains(&key) {
            warn!("Duplicate arrival for {} on upstream {} after it was joined; ignored", key, slot);
            return None;
        }
        let partial = self.pending.entry(key.clone()).or_insert_with(|| Partial {
            slots: vec![None; arity],
            filled: 0,
        });

        let entry = partial.slots.get_mut(slot)?;
        if entry.is_some() {
            warn!("Duplicate arrival for {} on upstream {}; keeping the first", key, slot);
            return None;
        }
        *entry = Some(artifacts);
        partial.filled += 1;

        if partial.filled < arity {
            return None;
        }
        let partial = self.pending.remove(&key)?;
        self.completed.insert(key.clone());
        let mut merged = Artifacts::new();
        for contribution in partial.slots.into_iter().flatten() {
            merged.absorb(contribution);
        }
        Some(Tuple::new(key, merged))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Empties the buffer, returning the keys that never completed (sorted).
    pub fn drain_incomplete(&mut self) -> Vec<SampleKey> {
        let mut keys: Vec<SampleKey> = self.pending.drain().map(|(k, _)| k).collect();
        keys.sort();
        keys
    }
}


/// Consumes all upstreams concurrently and emits completed keys to `output`.
/// `output` is closed once every upstream has closed.
///
/// # Arguments
///
/// * `spec` - Join descriptor; `inputs[i]` pairs with `upstreams[i]`.
/// * `upstreams` - One receiver per upstream channel.
/// * `output` - Channel for combined tuples.
///
/// # Returns
/// JoinReport with the emitted count and dropped keys.
pub async fn run_join(spec: JoinSpec, upstreams: Vec<TupleReceiver>, output: Channel) -> JoinReport {
    let mut buffer = JoinBuffer::new(upstreams.len());
    let mut arrivals = stream::select_all(
        upstreams
            .into_iter()
            .enumerate()
            .map(|(slot, rx)| ReceiverStream::new(rx).map(move |tuple| (slot, tuple))),
    );

    let mut report = JoinReport {
        join: spec.name.clone(),
        ..Default::default()
    };
    while let Some((slot, tuple)) = arrivals.next().await {
        if let Some(combined) = buffer.offer(slot, tuple) {
            debug!("Join {} complete for {}", spec.name, combined.key);
            output.send(combined).await;
            report.emitted += 1;
        }
    }

    report.dropped = buffer.drain_incomplete();
    for key in &report.dropped {
        debug!("Join {} dropped incomplete key {}", spec.name, key);
    }
    output.close();

    info!(
        "Join {} finished: {} emitted, {} incomplete",
        spec.name,
        report.emitted,
        report.dropped.len()
    );
    report
}
