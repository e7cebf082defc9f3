//! Unit-of-work identity and in-build deduplication
//!
//! The identity is a hash over the implementation id, every input
//! property fingerprint (by name), and the declared output layout. Two
//! nodes that compute the same identity in one build run the action only
//! once: the first to claim it leads, the others wait and reuse its
//! result through the in-memory build cache tier.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Condvar, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hasher::Fingerprinter;
use crate::schema::{InputSnapshot, OutputProperty};

/// Hash-of-hashes identifying a unit of work
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub(crate) fn from_hex(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the identity of a node from its snapshotted inputs
pub fn compute_identity(
    fingerprinter: &Fingerprinter,
    implementation: &str,
    inputs: &InputSnapshot,
    outputs: &[OutputProperty],
) -> Identity {
    let mut lease = fingerprinter.lease();
    let digester = lease.digester();
    digester.update_field(b"kiln-identity v1");
    digester.update_field(implementation.as_bytes());

    // BTreeMap iteration keeps properties ordered by name
    digester.update(&(inputs.properties().len() as u64).to_le_bytes());
    for (name, property) in inputs.properties() {
        digester.update_field(name.as_bytes());
        digester.update_field(property.fingerprint.as_str().as_bytes());
    }

    digester.update(&(outputs.len() as u64).to_le_bytes());
    for output in outputs {
        digester.update_field(output.name.as_bytes());
        digester.update_field(output.kind.as_str().as_bytes());
    }

    Identity(digester.finish_hex())
}

enum ClaimState {
    Running,
    Finished { produced: bool },
}

/// Outcome of claiming an identity
pub enum Claim<'a> {
    /// The caller must do the work and complete the guard
    Leader(ClaimGuard<'a>),
    /// Another node already produced a result for this identity
    Follower,
}

/// Tracks which identities are being executed in this build
#[derive(Default)]
pub struct IdentityRegistry {
    states: Mutex<HashMap<Identity, ClaimState>>,
    changed: Condvar,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `identity`, blocking while another node is executing it
    ///
    /// When the previous leader finished without producing a result the
    /// caller becomes the new leader.
    pub fn claim(&self, identity: &Identity) -> Claim<'_> {
        let mut states = self
            .states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            match states.get(identity) {
                None | Some(ClaimState::Finished { produced: false }) => {
                    states.insert(identity.clone(), ClaimState::Running);
                    return Claim::Leader(ClaimGuard {
                        registry: self,
                        identity: identity.clone(),
                        produced: false,
                    });
                }
                Some(ClaimState::Finished { produced: true }) => return Claim::Follower,
                Some(ClaimState::Running) => {
                    debug!(identity = %identity, "waiting for identical work in progress");
                    states = self
                        .changed
                        .wait(states)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        }
    }

    fn finish(&self, identity: &Identity, produced: bool) {
        let mut states = self
            .states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        states.insert(identity.clone(), ClaimState::Finished { produced });
        self.changed.notify_all();
    }
}

/// Held by the leader of an identity; releasing it wakes followers
pub struct ClaimGuard<'a> {
    registry: &'a IdentityRegistry,
    identity: Identity,
    produced: bool,
}

impl ClaimGuard<'_> {
    /// Mark the result as available to followers
    pub fn complete(mut self) {
        self.produced = true;
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.registry.finish(&self.identity, self.produced);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FileInput, WorkSchema};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn identity_of(schema: &WorkSchema, implementation: &str) -> Identity {
        let fingerprinter = Fingerprinter::default();
        let inputs = schema.snapshot_inputs(&fingerprinter).unwrap();
        compute_identity(&fingerprinter, implementation, &inputs, schema.outputs())
    }

    #[test]
    fn test_identity_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("in.txt");
        std::fs::write(&src, b"data").unwrap();
        let schema = WorkSchema::builder()
            .file(FileInput::file("in", &src))
            .scalar("level", 2)
            .build();

        assert_eq!(identity_of(&schema, "compile"), identity_of(&schema, "compile"));
        assert_ne!(identity_of(&schema, "compile"), identity_of(&schema, "link"));

        std::fs::write(&src, b"date").unwrap();
        let changed = identity_of(&schema, "compile");
        std::fs::write(&src, b"data").unwrap();
        assert_ne!(changed, identity_of(&schema, "compile"));
    }

    #[test]
    fn test_scalar_changes_identity() {
        let a = WorkSchema::builder().scalar("level", 2).build();
        let b = WorkSchema::builder().scalar("level", 3).build();
        assert_ne!(identity_of(&a, "x"), identity_of(&b, "x"));
    }

    #[test]
    fn test_follower_reuses_completed_leader() {
        let registry = IdentityRegistry::new();
        let id = Identity("abc".into());
        match registry.claim(&id) {
            Claim::Leader(guard) => guard.complete(),
            Claim::Follower => panic!("first claim must lead"),
        }
        assert!(matches!(registry.claim(&id), Claim::Follower));
    }

    #[test]
    fn test_failed_leader_hands_over() {
        let registry = IdentityRegistry::new();
        let id = Identity("abc".into());
        match registry.claim(&id) {
            Claim::Leader(guard) => drop(guard),
            Claim::Follower => panic!("first claim must lead"),
        }
        assert!(matches!(registry.claim(&id), Claim::Leader(_)));
    }

    #[test]
    fn test_waiters_block_until_leader_finishes() {
        let registry = Arc::new(IdentityRegistry::new());
        let id = Identity("shared".into());
        let executions = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let id = id.clone();
                let executions = Arc::clone(&executions);
                std::thread::spawn(move || match registry.claim(&id) {
                    Claim::Leader(guard) => {
                        executions.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(30));
                        guard.complete();
                    }
                    Claim::Follower => {}
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }
}
