//! Authorization, allow-list, and pause collaborators.
//!
//! The engine consults these at the entry of every operation; reference
//! implementations cover the common single-administrator deployment and
//! tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tranche_types::Identity;

/// Decides which callers may perform administrative operations.
pub trait AdminPolicy: Send + Sync {
    fn is_authorized_admin(&self, caller: &Identity) -> bool;
}

/// A single fixed administrator.
#[derive(Clone, Debug)]
pub struct SingleAdmin {
    admin: Identity,
}

impl SingleAdmin {
    pub fn new(admin: Identity) -> Self {
        Self { admin }
    }
}

impl AdminPolicy for SingleAdmin {
    fn is_authorized_admin(&self, caller: &Identity) -> bool {
        *caller == self.admin
    }
}

/// Decides which identities may contribute, given an opaque proof.
pub trait AllowList: Send + Sync {
    fn verify(&self, identity: &Identity, proof: &[u8]) -> bool;
}

/// Accepts everyone. The default for administered ledgers, where the
/// administrator is the only writer anyway.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl AllowList for AllowAll {
    fn verify(&self, _identity: &Identity, _proof: &[u8]) -> bool {
        true
    }
}

/// A fixed membership set; the proof is ignored.
#[derive(Clone, Debug, Default)]
pub struct StaticAllowList {
    members: HashSet<Identity>,
}

impl StaticAllowList {
    pub fn new(members: impl IntoIterator<Item = Identity>) -> Self {
        Self {
            members: members.into_iter().collect(),
        }
    }
}

impl AllowList for StaticAllowList {
    fn verify(&self, identity: &Identity, _proof: &[u8]) -> bool {
        self.members.contains(identity)
    }
}

/// Reports whether all mutating operations are globally suspended.
pub trait PauseSwitch: Send + Sync {
    fn is_suspended(&self) -> bool;
}

/// Errors from the pause toggle.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PauseError {
    #[error("operations are already paused")]
    AlreadyPaused,
    #[error("operations are not paused")]
    NotPaused,
}

/// An atomic pause flag with redundant-toggle detection.
#[derive(Debug, Default)]
pub struct PauseToggle {
    suspended: AtomicBool,
}

impl PauseToggle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) -> Result<(), PauseError> {
        if self.suspended.swap(true, Ordering::SeqCst) {
            return Err(PauseError::AlreadyPaused);
        }
        Ok(())
    }

    pub fn unpause(&self) -> Result<(), PauseError> {
        if !self.suspended.swap(false, Ordering::SeqCst) {
            return Err(PauseError::NotPaused);
        }
        Ok(())
    }
}

impl PauseSwitch for PauseToggle {
    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }
}
