//! The session-expired interstitial: at most one visible at a time.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterstitialId(pub u64);

impl fmt::Display for InterstitialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interstitial-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Confirm,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("interstitial surface unavailable: {reason}")]
pub struct SurfaceUnavailable {
    pub reason: String,
}

/// Presentation layer for the interstitial.
///
/// `mount` renders a confirm/cancel prompt and hands back the channel on
/// which the user's decision arrives. `unmount` removes it; a surface must
/// tolerate unmounting an id it already removed.
pub trait InterstitialSurface: Send + Sync {
    fn mount(
        &self,
        id: InterstitialId,
        message: &str,
    ) -> Result<oneshot::Receiver<Decision>, SurfaceUnavailable>;

    fn unmount(&self, id: InterstitialId);
}

/// Synchronous yes/no prompt used when the surface cannot mount.
/// `None` means no prompt is available either.
pub trait FallbackPrompt: Send + Sync {
    fn confirm(&self, message: &str) -> Option<bool>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrompt;

impl FallbackPrompt for NoPrompt {
    fn confirm(&self, _message: &str) -> Option<bool> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AutoConfirm;

impl FallbackPrompt for AutoConfirm {
    fn confirm(&self, _message: &str) -> Option<bool> {
        Some(true)
    }
}

/// Surface with nothing to render on.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessSurface;

impl InterstitialSurface for HeadlessSurface {
    fn mount(
        &self,
        _id: InterstitialId,
        _message: &str,
    ) -> Result<oneshot::Receiver<Decision>, SurfaceUnavailable> {
        Err(SurfaceUnavailable {
            reason: "headless".to_string(),
        })
    }

    fn unmount(&self, _id: InterstitialId) {}
}

#[derive(Debug)]
pub enum InterstitialEvent {
    Mounted {
        id: InterstitialId,
        message: String,
        responder: oneshot::Sender<Decision>,
    },
    Unmounted {
        id: InterstitialId,
    },
}

/// Surface that forwards mount/unmount events to a UI task over a channel.
///
/// The surface reports itself unavailable once the receiving side is gone.
#[derive(Debug, Clone)]
pub struct ChannelSurface {
    events: mpsc::UnboundedSender<InterstitialEvent>,
}

impl ChannelSurface {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<InterstitialEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (Self { events }, receiver)
    }
}

impl InterstitialSurface for ChannelSurface {
    fn mount(
        &self,
        id: InterstitialId,
        message: &str,
    ) -> Result<oneshot::Receiver<Decision>, SurfaceUnavailable> {
        let (responder, decision) = oneshot::channel();
        self.events
            .send(InterstitialEvent::Mounted {
                id,
                message: message.to_string(),
                responder,
            })
            .map_err(|_| SurfaceUnavailable {
                reason: "interstitial listener closed".to_string(),
            })?;
        Ok(decision)
    }

    fn unmount(&self, id: InterstitialId) {
        let _ = self.events.send(InterstitialEvent::Unmounted { id });
    }
}

struct Mounted {
    id: InterstitialId,
    on_surface: bool,
    waiter: JoinHandle<()>,
}

/// Counts interstitials whose decision has not been handled yet.
struct Pending(Arc<watch::Sender<usize>>);

impl Pending {
    fn track(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|count| *count += 1);
        Self(Arc::clone(counter))
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.0.send_modify(|count| *count = count.saturating_sub(1));
    }
}

pub struct SessionExpiredNotifier {
    surface: Arc<dyn InterstitialSurface>,
    fallback: Arc<dyn FallbackPrompt>,
    active: Arc<Mutex<Option<Mounted>>>,
    next_id: AtomicU64,
    pending: Arc<watch::Sender<usize>>,
}

impl fmt::Debug for SessionExpiredNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionExpiredNotifier")
            .field("active", &self.active_id())
            .finish_non_exhaustive()
    }
}

impl Default for SessionExpiredNotifier {
    fn default() -> Self {
        Self::new(Arc::new(HeadlessSurface), Arc::new(NoPrompt))
    }
}

impl SessionExpiredNotifier {
    #[must_use]
    pub fn new(surface: Arc<dyn InterstitialSurface>, fallback: Arc<dyn FallbackPrompt>) -> Self {
        Self {
            surface,
            fallback,
            active: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
            pending: Arc::new(watch::channel(0).0),
        }
    }

    #[must_use]
    pub fn active_id(&self) -> Option<InterstitialId> {
        lock(&self.active).as_ref().map(|mounted| mounted.id)
    }

    /// Resolves once every shown interstitial has been answered or replaced
    /// and its callback has run.
    pub async fn wait_idle(&self) {
        let mut pending = self.pending.subscribe();
        let _ = pending.wait_for(|count| *count == 0).await;
    }

    /// Show the interstitial, replacing any visible one, and return at once.
    ///
    /// A replaced interstitial is unmounted and its callbacks are dropped
    /// without being called. Exactly one of `on_confirm`/`on_cancel` runs
    /// for the new one, unless it is itself replaced first. When the surface
    /// cannot mount, the fallback prompt is asked on the blocking pool.
    /// Must be called from within a tokio runtime.
    pub fn show<C, X>(&self, message: &str, on_confirm: C, on_cancel: X)
    where
        C: FnOnce() + Send + 'static,
        X: FnOnce() + Send + 'static,
    {
        self.show_boxed(message, Box::new(on_confirm), Box::new(on_cancel));
    }

    fn show_boxed(&self, message: &str, on_confirm: Callback, on_cancel: Callback) {
        let mut active = lock(&self.active);
        if let Some(previous) = active.take() {
            tracing::debug!(id = %previous.id, "replacing visible session-expired interstitial");
            previous.waiter.abort();
            if previous.on_surface {
                self.surface.unmount(previous.id);
            }
        }

        let id = InterstitialId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (decision, on_surface) = match self.surface.mount(id, message) {
            Ok(decision) => (
                async move { decision.await.unwrap_or(Decision::Cancel) }.boxed(),
                true,
            ),
            Err(error) => {
                tracing::warn!(%error, %id, "falling back to the session-expired prompt");
                (self.ask_fallback(message), false)
            }
        };

        let slot = Arc::clone(&self.active);
        let surface = Arc::clone(&self.surface);
        let pending = Pending::track(&self.pending);
        // The waiter locks `active` before acting, and we hold that lock until
        // the new entry is stored, so it always sees its own id or a successor.
        let waiter = tokio::spawn(async move {
            let _pending = pending;
            let decision = decision.await;
            {
                let mut active = lock(&slot);
                if active.as_ref().map(|mounted| mounted.id) != Some(id) {
                    return;
                }
                *active = None;
            }
            match decision {
                Decision::Confirm => on_confirm(),
                Decision::Cancel => on_cancel(),
            }
            if on_surface {
                surface.unmount(id);
            }
        });
        *active = Some(Mounted {
            id,
            on_surface,
            waiter,
        });
    }

    /// No answer, or a prompt that failed, counts as cancel.
    fn ask_fallback(&self, message: &str) -> BoxFuture<'static, Decision> {
        let fallback = Arc::clone(&self.fallback);
        let message = message.to_string();
        async move {
            match tokio::task::spawn_blocking(move || fallback.confirm(&message)).await {
                Ok(Some(true)) => Decision::Confirm,
                Ok(Some(false) | None) => Decision::Cancel,
                Err(error) => {
                    tracing::warn!(%error, "session-expired prompt failed");
                    Decision::Cancel
                }
            }
        }
        .boxed()
    }
}

fn lock(active: &Mutex<Option<Mounted>>) -> MutexGuard<'_, Option<Mounted>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
