//! Configuration convergence tracking.
//!
//! During a configuration session the device streams one chunk per
//! configuration leaf. The tracker accumulates them, answers "how far
//! along are we", and signals completion exactly once when the known leaf
//! set has been fully received. A reconnect resets the tracker: partial
//! progress from a dead session is never reported as live progress.
//!
//! The hashing refinement computes a SHA-256 digest per leaf and a root
//! digest over all leaf digests, so two snapshots can be diffed down to
//! the leaves that actually changed without comparing payloads. This only
//! saves downstream work; convergence itself is tracked by the leaf set.

use std::collections::BTreeMap;
use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::protocol::packet::ConfigLeaf;

/// A per-leaf digest snapshot of the received configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigSnapshot {
    leaf_hashes: BTreeMap<ConfigLeaf, [u8; 32]>,
}

impl ConfigSnapshot {
    /// Digest of one leaf, if received.
    #[must_use]
    pub fn leaf_hash(&self, leaf: ConfigLeaf) -> Option<&[u8; 32]> {
        self.leaf_hashes.get(&leaf)
    }

    /// Root digest over all received leaf digests, in canonical leaf order.
    #[must_use]
    pub fn root_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for (leaf, hash) in &self.leaf_hashes {
            hasher.update([leaf.wire().0 as u8, leaf.wire().1]);
            hasher.update(hash);
        }
        hasher.finalize().into()
    }

    /// Leaves whose digest differs between the two snapshots, including
    /// leaves present in only one of them.
    #[must_use]
    pub fn changed_leaves(&self, previous: &Self) -> Vec<ConfigLeaf> {
        ConfigLeaf::ALL
            .into_iter()
            .filter(|leaf| self.leaf_hashes.get(leaf) != previous.leaf_hashes.get(leaf))
            .collect()
    }
}

struct Inner {
    received: BTreeMap<ConfigLeaf, Bytes>,
    complete_signalled: bool,
    on_complete: Vec<Box<dyn Fn() + Send + Sync>>,
}

/// Tracks which configuration leaves the current session has delivered.
pub struct ConfigSync {
    inner: StdMutex<Inner>,
}

impl Default for ConfigSync {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigSync {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: StdMutex::new(Inner {
                received: BTreeMap::new(),
                complete_signalled: false,
                on_complete: Vec::new(),
            }),
        }
    }

    /// Records receipt of one configuration leaf.
    ///
    /// Idempotent: a repeated leaf overwrites the stored payload without
    /// double-counting progress. Returns true exactly once per session,
    /// on the chunk that completes the leaf set; completion callbacks fire
    /// on that same call.
    pub fn on_chunk(&self, leaf: ConfigLeaf, data: Bytes) -> bool {
        let callbacks_due = {
            let mut inner = self.inner.lock().expect("config tracker poisoned");
            if inner.received.insert(leaf, data).is_some() {
                tracing::debug!("config leaf {} re-received", leaf.name());
            } else {
                tracing::debug!(
                    "config leaf {} received ({}/{})",
                    leaf.name(),
                    inner.received.len(),
                    ConfigLeaf::COUNT
                );
            }

            let newly_complete =
                inner.received.len() == ConfigLeaf::COUNT && !inner.complete_signalled;
            if newly_complete {
                inner.complete_signalled = true;
                tracing::debug!("configuration session complete");
            }
            newly_complete
        };

        if callbacks_due {
            self.fire_complete();
        }
        callbacks_due
    }

    fn fire_complete(&self) {
        // Take the callbacks out, run them, put them back. Registration
        // during a callback would deadlock otherwise.
        let callbacks = {
            let mut inner = self.inner.lock().expect("config tracker poisoned");
            std::mem::take(&mut inner.on_complete)
        };
        for callback in &callbacks {
            callback();
        }
        let mut inner = self.inner.lock().expect("config tracker poisoned");
        let mut callbacks = callbacks;
        callbacks.append(&mut inner.on_complete);
        inner.on_complete = callbacks;
    }

    /// Registers a callback invoked when the current (or a later) session
    /// reaches completion.
    pub fn on_complete(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.inner
            .lock()
            .expect("config tracker poisoned")
            .on_complete
            .push(Box::new(callback));
    }

    /// True iff every known leaf has been received this session.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner
            .lock()
            .expect("config tracker poisoned")
            .received
            .len()
            == ConfigLeaf::COUNT
    }

    /// Progress through the leaf set, as an integer percentage in [0, 100].
    #[must_use]
    pub fn percent_complete(&self) -> u8 {
        let received = self
            .inner
            .lock()
            .expect("config tracker poisoned")
            .received
            .len();
        ((received * 100) / ConfigLeaf::COUNT) as u8
    }

    /// Number of leaves received so far.
    #[must_use]
    pub fn received_count(&self) -> usize {
        self.inner
            .lock()
            .expect("config tracker poisoned")
            .received
            .len()
    }

    /// The stored payload for one leaf, if received this session.
    #[must_use]
    pub fn leaf(&self, leaf: ConfigLeaf) -> Option<Bytes> {
        self.inner
            .lock()
            .expect("config tracker poisoned")
            .received
            .get(&leaf)
            .cloned()
    }

    /// Digest snapshot of everything received so far.
    #[must_use]
    pub fn snapshot(&self) -> ConfigSnapshot {
        let inner = self.inner.lock().expect("config tracker poisoned");
        let leaf_hashes = inner
            .received
            .iter()
            .map(|(leaf, data)| {
                let digest: [u8; 32] = Sha256::digest(data).into();
                (*leaf, digest)
            })
            .collect();
        ConfigSnapshot { leaf_hashes }
    }

    /// Forgets all progress. Called on reconnect: the device is treated as
    /// requiring full resynchronization, and completion will signal again
    /// once the new session converges.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("config tracker poisoned");
        inner.received.clear();
        inner.complete_signalled = false;
        tracing::debug!("config tracker reset");
    }
}
