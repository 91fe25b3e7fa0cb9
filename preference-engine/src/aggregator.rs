use memefeed_core::{CoreError, Embedding, ReactionInput, UserId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::aggregate::{contributing, weighted_mean_normalized};
use crate::WeightTable;

/// Read side of the reaction store.
pub trait ReactionSource: Send + Sync {
    /// Every current reaction of `user` as `(kind, post embedding)` rows, in
    /// no particular order. Posts without an embedding may be included with
    /// `None`; they are filtered before aggregation.
    fn reaction_inputs(
        &self,
        user: UserId,
    ) -> impl Future<Output = Result<Vec<ReactionInput>, CoreError>> + Send;
}

/// Write side of the user preference store.
pub trait PreferenceSink: Send + Sync {
    /// Overwrites the user's preference vector; `None` clears it.
    fn store_preference(
        &self,
        user: UserId,
        preference: Option<&[f64]>,
    ) -> impl Future<Output = Result<(), CoreError>> + Send;
}

/// Called after a reaction create/update/delete for `user` has been committed.
pub trait ReactionHook: Send + Sync {
    fn on_reactions_changed(&self, user: UserId) -> impl Future<Output = Result<(), CoreError>> + Send;
}

impl<H: ReactionHook> ReactionHook for Arc<H> {
    fn on_reactions_changed(&self, user: UserId) -> impl Future<Output = Result<(), CoreError>> + Send {
        (**self).on_reactions_changed(user)
    }
}

/// Rebuilds a user's preference vector from scratch out of their reactions.
///
/// Recomputations for the same user run one at a time; each re-reads the full
/// reaction set so the last write always reflects post-mutation state.
pub struct PreferenceAggregator<S> {
    store: S,
    weights: Arc<WeightTable>,
    dimension: Option<usize>,
    user_locks: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S> PreferenceAggregator<S>
where
    S: ReactionSource + PreferenceSink,
{
    pub fn new(store: S, weights: Arc<WeightTable>) -> Self {
        Self {
            store,
            weights,
            dimension: None,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Require every contributing embedding to have exactly `dimension` values.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn weights(&self) -> &WeightTable {
        &self.weights
    }

    /// Recomputes and persists the preference vector of `user`, returning what
    /// was written. Storage errors propagate; a failed read writes nothing.
    pub async fn recompute(&self, user: UserId) -> Result<Option<Embedding>, CoreError> {
        let entry = self.user_lock(user);
        let _guard = entry.lock.lock().await;
        self.recompute_unlocked(user).await
    }

    async fn recompute_unlocked(&self, user: UserId) -> Result<Option<Embedding>, CoreError> {
        let inputs = self.store.reaction_inputs(user).await?;
        let vectors = contributing(&inputs, &self.weights);

        let preference = weighted_mean_normalized(&vectors, self.dimension)?;
        debug!(
            "Recomputed preferences for user {}: {} of {} reactions contribute, vector {}",
            user,
            vectors.len(),
            inputs.len(),
            if preference.is_some() { "present" } else { "absent" }
        );

        self.store
            .store_preference(user, preference.as_deref())
            .await?;
        Ok(preference)
    }

    fn user_lock(&self, user: UserId) -> UserLock<'_> {
        let lock = self
            .user_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(user)
            .or_default()
            .clone();
        UserLock {
            locks: &self.user_locks,
            user,
            lock,
        }
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.user_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// A handle on one user's recompute mutex. Dropping it, including when the
/// recompute future is cancelled while waiting, removes the map entry once no
/// other handle is left.
struct UserLock<'a> {
    locks: &'a Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
    user: UserId,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for UserLock<'_> {
    fn drop(&mut self) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Only the map and this handle hold it: nobody else is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.user);
        }
    }
}

impl<S> ReactionHook for PreferenceAggregator<S>
where
    S: ReactionSource + PreferenceSink,
{
    async fn on_reactions_changed(&self, user: UserId) -> Result<(), CoreError> {
        self.recompute(user).await.map(|_| ())
    }
}
