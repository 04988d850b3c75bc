//! Authoritative cluster policy latch
//!
//! The first policy reconciled wins and keeps winning until it is deleted.
//! The latch is shared by every concurrent reconcile, so it lives behind a
//! mutex and each transition is a single locked step.

use parking_lot::Mutex;
use tracing::info;

/// Outcome of presenting a policy name to the latch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The name is (now) the authoritative policy
    Authoritative,
    /// Another policy holds the latch
    Ignored { holder: String },
}

#[derive(Debug, Default)]
pub struct SingletonGuard {
    holder: Mutex<Option<String>>,
}

impl SingletonGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch `name` if unset, then report whether it holds the latch
    pub fn claim(&self, name: &str) -> Claim {
        let mut holder = self.holder.lock();
        match holder.as_deref() {
            Some(current) if current == name => Claim::Authoritative,
            Some(current) => Claim::Ignored {
                holder: current.to_string(),
            },
            None => {
                info!(policy = %name, "Latched authoritative cluster policy");
                *holder = Some(name.to_string());
                Claim::Authoritative
            }
        }
    }

    /// Clear the latch if `name` holds it; returns whether it was cleared
    pub fn release(&self, name: &str) -> bool {
        let mut holder = self.holder.lock();
        if holder.as_deref() == Some(name) {
            info!(policy = %name, "Released authoritative cluster policy");
            *holder = None;
            true
        } else {
            false
        }
    }

    pub fn holder(&self) -> Option<String> {
        self.holder.lock().clone()
    }
}
