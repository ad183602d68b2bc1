//! User Identity Abstraction
//!
//! The core never authenticates anybody. It only asks the host who is
//! currently signed in, and scopes every remote path by that identifier.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::RwLock;

/// Stable identifier of the signed-in user.
///
/// Never empty. Used to namespace remote object paths and persisted state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Returns `None` for blank identifiers.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity provider trait
///
/// Implemented by the host's authentication layer:
/// - **Android/iOS**: Firebase Auth current user
/// - **Desktop**: a stored session
///
/// Must be cheap and non-blocking; the core calls it on every operation.
pub trait IdentityProvider: Send + Sync {
    /// The signed-in user, or `None` when signed out.
    fn current_identity(&self) -> Option<OwnerId>;
}

/// In-memory identity holder the host updates on sign-in/sign-out.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    current: RwLock<Option<OwnerId>>,
}

impl StaticIdentity {
    pub fn new(owner: Option<OwnerId>) -> Self {
        Self {
            current: RwLock::new(owner),
        }
    }

    pub fn set(&self, owner: Option<OwnerId>) {
        if let Ok(mut guard) = self.current.write() {
            *guard = owner;
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_identity(&self) -> Option<OwnerId> {
        self.current.read().ok().and_then(|guard| guard.clone())
    }
}
