//! Single-flight coordination of session renewal.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

type PendingRefresh = Shared<BoxFuture<'static, bool>>;

#[derive(Default)]
struct RefreshState {
    generation: u64,
    in_flight: Option<PendingRefresh>,
}

/// Ensures at most one renewal runs at a time.
///
/// Callers arriving while a renewal is in flight await that same renewal.
/// The renewal runs as its own task and clears the slot when it settles, so
/// a caller that stops waiting never leaves the slot occupied.
#[derive(Clone, Default)]
pub struct RefreshCoordinator {
    state: Arc<Mutex<RefreshState>>,
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("in_flight", &self.is_in_flight())
            .finish()
    }
}

impl RefreshCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        lock(&self.state).in_flight.is_some()
    }

    /// Join the in-flight renewal, or start one with `start`.
    ///
    /// `start` is only called when the slot is empty. Must be called from
    /// within a tokio runtime.
    pub async fn refresh<F, Fut>(&self, start: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let pending = {
            let mut state = lock(&self.state);
            if let Some(pending) = state.in_flight.as_ref() {
                tracing::debug!("joining in-flight session refresh");
                pending.clone()
            } else {
                state.generation += 1;
                let generation = state.generation;
                let operation = start();
                let task_state = Arc::clone(&self.state);
                let handle = tokio::spawn(async move {
                    let refreshed = operation.await;
                    settle(&task_state, generation);
                    refreshed
                });
                let join_state = Arc::clone(&self.state);
                let pending = async move {
                    let refreshed = match handle.await {
                        Ok(refreshed) => refreshed,
                        Err(error) => {
                            tracing::warn!(%error, "session refresh task failed");
                            false
                        }
                    };
                    settle(&join_state, generation);
                    refreshed
                }
                .boxed()
                .shared();
                tracing::info!(generation, "session refresh started");
                state.in_flight = Some(pending.clone());
                pending
            }
        };
        pending.await
    }
}

fn settle(state: &Mutex<RefreshState>, generation: u64) {
    let mut state = lock(state);
    if state.generation == generation && state.in_flight.is_some() {
        state.in_flight = None;
        tracing::debug!(generation, "session refresh settled");
    }
}

fn lock(state: &Mutex<RefreshState>) -> MutexGuard<'_, RefreshState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
