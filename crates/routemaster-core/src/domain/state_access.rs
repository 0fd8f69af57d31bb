//! Scoped access to the typed state of one instance
//!
//! A [`StateAccess`] is handed to exactly one step invocation. It exposes the
//! state committed by the previous hop and accepts a single replacement write.
//! The engine keeps the matching [`StateCommit`] and collects the write once
//! the handler has returned, which closes the access for good.

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::correlation::{CorrelationId, SubscriptionId};
use super::repository::StateStore;
use crate::CoreError;

/// Per-instance state carried between hops
pub trait State: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> State for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

struct WriteSlot<S> {
    open: AtomicBool,
    pending: Mutex<Option<S>>,
}

/// Read/write capability over one instance's state, valid for one handler invocation
pub struct StateAccess<S> {
    subscription: SubscriptionId,
    correlation_id: CorrelationId,
    snapshot: S,
    slot: Arc<WriteSlot<S>>,
}

/// Engine side of a [`StateAccess`]
pub struct StateCommit<S> {
    slot: Arc<WriteSlot<S>>,
}

impl<S: State> StateAccess<S> {
    /// Open access to the committed state of an instance
    ///
    /// Fails with `StateNotFound` when the store has nothing for the id.
    pub async fn open(
        store: &dyn StateStore,
        subscription: &SubscriptionId,
        correlation_id: &CorrelationId,
    ) -> Result<(Self, StateCommit<S>), CoreError> {
        let value = store
            .load(subscription, correlation_id)
            .await?
            .ok_or_else(|| CoreError::StateNotFound(correlation_id.0.clone()))?;
        let snapshot: S = serde_json::from_value(value)?;
        Ok(Self::with_snapshot(
            subscription.clone(),
            correlation_id.clone(),
            snapshot,
        ))
    }

    pub(crate) fn with_snapshot(
        subscription: SubscriptionId,
        correlation_id: CorrelationId,
        snapshot: S,
    ) -> (Self, StateCommit<S>) {
        let slot = Arc::new(WriteSlot {
            open: AtomicBool::new(true),
            pending: Mutex::new(None),
        });
        (
            Self {
                subscription,
                correlation_id,
                snapshot,
                slot: slot.clone(),
            },
            StateCommit { slot },
        )
    }

    /// Latest committed state of the instance
    pub fn load(&self) -> S {
        self.snapshot.clone()
    }

    /// Record the replacement state for this hop
    ///
    /// Visible to the next hop once the current invocation completes. Only one
    /// write is accepted per invocation.
    pub fn save(&self, state: S) -> Result<(), CoreError> {
        if !self.slot.open.load(Ordering::Acquire) {
            return Err(CoreError::StateAccessExpired(self.correlation_id.0.clone()));
        }
        let mut pending = self.slot.pending.lock();
        if pending.is_some() {
            return Err(CoreError::StateAccessViolation(format!(
                "state for {} was already written during this hop",
                self.correlation_id
            )));
        }
        *pending = Some(state);
        Ok(())
    }

    /// Instance this access is bound to
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Route this access is bound to
    pub fn subscription(&self) -> &SubscriptionId {
        &self.subscription
    }
}

impl<S> StateCommit<S> {
    /// Close the access and take the write made during the invocation, if any
    pub fn finish(self) -> Option<S> {
        self.slot.open.store(false, Ordering::Release);
        self.slot.pending.lock().take()
    }
}

impl<S> Drop for StateCommit<S> {
    fn drop(&mut self) {
        self.slot.open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: u32,
    }

    fn access(value: u32) -> (StateAccess<Counter>, StateCommit<Counter>) {
        StateAccess::with_snapshot(
            SubscriptionId::new("sub"),
            CorrelationId::from("cid"),
            Counter { value },
        )
    }

    #[test]
    fn test_load_returns_snapshot() {
        let (access, _commit) = access(3);
        assert_eq!(access.load(), Counter { value: 3 });
    }

    #[test]
    fn test_save_is_collected_by_commit() {
        let (access, commit) = access(1);
        access.save(Counter { value: 2 }).unwrap();
        // the snapshot is unchanged until the hop completes
        assert_eq!(access.load(), Counter { value: 1 });
        assert_eq!(commit.finish(), Some(Counter { value: 2 }));
    }

    #[test]
    fn test_second_save_is_rejected() {
        let (access, commit) = access(1);
        access.save(Counter { value: 2 }).unwrap();
        let err = access.save(Counter { value: 3 }).unwrap_err();
        assert!(matches!(err, CoreError::StateAccessViolation(_)));
        assert_eq!(commit.finish(), Some(Counter { value: 2 }));
    }

    #[test]
    fn test_save_after_finish_is_expired() {
        let (access, commit) = access(1);
        assert_eq!(commit.finish(), None);
        let err = access.save(Counter { value: 9 }).unwrap_err();
        assert!(matches!(err, CoreError::StateAccessExpired(_)));
    }

    #[test]
    fn test_dropped_commit_expires_access() {
        let (access, commit) = access(1);
        drop(commit);
        assert!(matches!(
            access.save(Counter { value: 2 }),
            Err(CoreError::StateAccessExpired(_))
        ));
    }
}
