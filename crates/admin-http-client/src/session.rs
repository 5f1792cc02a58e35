//! Shared session-expiry coordination: refresh slot, interstitial and redirect guard.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::notifier::SessionExpiredNotifier;
use crate::refresh::RefreshCoordinator;
use crate::routes::LocaleRouting;

/// Set once a session-expired redirect has been offered to the user.
///
/// While armed, further hard auth failures do not prompt again.
#[derive(Debug, Default)]
pub struct RedirectGuard {
    triggered: AtomicBool,
}

impl RedirectGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the guard; false if it was already armed.
    pub fn try_arm(&self) -> bool {
        self.triggered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn reset(&self) {
        self.triggered.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub pathname: String,
    pub search: String,
    pub hash: String,
}

impl Location {
    /// Split a `path?query#hash` string.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let (rest, hash) = match raw.find('#') {
            Some(index) => (&raw[..index], raw[index..].to_string()),
            None => (raw, String::new()),
        };
        let (pathname, search) = match rest.find('?') {
            Some(index) => (rest[..index].to_string(), rest[index..].to_string()),
            None => (rest.to_string(), String::new()),
        };
        let pathname = if pathname.is_empty() {
            "/".to_string()
        } else {
            pathname
        };
        Self {
            pathname,
            search,
            hash,
        }
    }

    #[must_use]
    pub fn relative_href(&self) -> String {
        format!("{}{}{}", self.pathname, self.search, self.hash)
    }
}

/// The host's view of "where the user is" and how to send them elsewhere.
pub trait Navigator: Send + Sync {
    fn current_location(&self) -> Location;

    fn document_language(&self) -> Option<String> {
        None
    }

    /// Full navigation to `url`.
    fn assign(&self, url: &str);
}

/// Navigator that only records navigations.
#[derive(Debug, Default)]
pub struct MemoryNavigator {
    location: Mutex<Location>,
    language: Mutex<Option<String>>,
    navigations: Mutex<Vec<String>>,
}

impl MemoryNavigator {
    #[must_use]
    pub fn new(location: &str) -> Self {
        Self {
            location: Mutex::new(Location::parse(location)),
            ..Self::default()
        }
    }

    pub fn set_location(&self, location: &str) {
        *self
            .location
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Location::parse(location);
    }

    pub fn set_document_language(&self, language: Option<&str>) {
        *self
            .language
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = language.map(str::to_string);
    }

    #[must_use]
    pub fn navigations(&self) -> Vec<String> {
        self.navigations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Navigator for MemoryNavigator {
    fn current_location(&self) -> Location {
        self.location
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn document_language(&self) -> Option<String> {
        self.language
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn assign(&self, url: &str) {
        tracing::info!(url, "navigating");
        self.navigations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.to_string());
    }
}

/// Coordination state shared by every client of one session.
///
/// Clones of an `ApiClient` share it; separate clients share it by being
/// built with the same `Arc<SessionCoordination>`.
pub struct SessionCoordination {
    refresh: RefreshCoordinator,
    notifier: SessionExpiredNotifier,
    guard: Arc<RedirectGuard>,
    routing: LocaleRouting,
    navigator: Arc<dyn Navigator>,
}

impl fmt::Debug for SessionCoordination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCoordination")
            .field("refresh", &self.refresh)
            .field("notifier", &self.notifier)
            .field("guard", &self.guard)
            .field("routing", &self.routing)
            .finish_non_exhaustive()
    }
}

impl SessionCoordination {
    #[must_use]
    pub fn new(
        notifier: SessionExpiredNotifier,
        routing: LocaleRouting,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            refresh: RefreshCoordinator::new(),
            notifier,
            guard: Arc::new(RedirectGuard::new()),
            routing,
            navigator,
        }
    }

    #[must_use]
    pub fn refresh(&self) -> &RefreshCoordinator {
        &self.refresh
    }

    #[must_use]
    pub fn notifier(&self) -> &SessionExpiredNotifier {
        &self.notifier
    }

    #[must_use]
    pub fn guard(&self) -> &RedirectGuard {
        &self.guard
    }

    #[must_use]
    pub fn routing(&self) -> &LocaleRouting {
        &self.routing
    }

    /// Login URL for the current location, carrying it as `redirect`.
    #[must_use]
    pub fn login_redirect_url(&self) -> String {
        let location = self.navigator.current_location();
        let language = self.navigator.document_language();
        let route = self
            .routing
            .resolve_login_route(&location.pathname, language.as_deref());
        format!(
            "{route}?redirect={}",
            urlencoding::encode(&location.relative_href())
        )
    }

    /// Offer the user a way back to the login page, at most once at a time.
    ///
    /// Returns whether an interstitial was requested. The user's answer is
    /// handled in the background; nothing here waits for it.
    pub fn report_session_expired(&self, message: &str) -> bool {
        let location = self.navigator.current_location();
        let language = self.navigator.document_language();
        if self
            .routing
            .is_login_pathname(&location.pathname, language.as_deref())
        {
            tracing::debug!(path = %location.pathname, "already on the login route");
            self.guard.reset();
            return false;
        }
        if !self.guard.try_arm() {
            tracing::debug!("session-expired redirect already pending");
            return false;
        }

        let target = self.login_redirect_url();
        tracing::warn!(login = %target, "session expired, prompting for sign-in");
        let navigator = Arc::clone(&self.navigator);
        let guard = Arc::clone(&self.guard);
        self.notifier.show(
            message,
            move || navigator.assign(&target),
            move || guard.reset(),
        );
        true
    }
}
