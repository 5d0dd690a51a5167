//! Lazily obtained, memoized archive password.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Source of a password when the archive asks for one.
///
/// Implemented by the console or UI layer. Returning `None` means the user
/// gave up; the pass that asked fails with a wrong-password outcome.
pub trait CredentialProvider: Send + Sync {
    fn prompt(&self) -> Option<String>;
}

/// Provider that never has a password to offer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrompt;

impl CredentialProvider for NoPrompt {
    fn prompt(&self) -> Option<String> {
        None
    }
}

impl<F> CredentialProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn prompt(&self) -> Option<String> {
        self()
    }
}

#[derive(Default)]
struct State {
    password: Option<String>,
    prompted: bool,
    confirmed: bool,
}

/// Per-archive credential.
///
/// The provider is asked at most once per store. The lock is held while
/// prompting, so concurrent requests during a pending prompt wait for its
/// answer instead of prompting again. Once a decode succeeds with the
/// password it is confirmed and never dropped.
pub struct CredentialStore {
    provider: Arc<dyn CredentialProvider>,
    state: Mutex<State>,
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CredentialStore")
            .field("has_password", &state.password.is_some())
            .field("prompted", &state.prompted)
            .field("confirmed", &state.confirmed)
            .finish()
    }
}

impl CredentialStore {
    pub fn new(initial: Option<String>, provider: Arc<dyn CredentialProvider>) -> Self {
        Self {
            provider,
            state: Mutex::new(State {
                password: initial,
                ..State::default()
            }),
        }
    }

    /// Returns the known password, prompting the first time none is known.
    pub fn obtain(&self) -> Option<String> {
        let mut state = self.state.lock();
        if state.password.is_none() && !state.prompted {
            state.prompted = true;
            tracing::debug!("asking for archive password");
            state.password = self.provider.prompt();
        }
        state.password.clone()
    }

    /// Marks the current password as proven by a successful decode.
    pub fn confirm(&self) {
        let mut state = self.state.lock();
        if state.password.is_some() && !state.confirmed {
            tracing::debug!("archive password confirmed");
            state.confirmed = true;
        }
    }

    /// Forgets a password the engine rejected. A confirmed one is kept.
    pub fn reject(&self) {
        let mut state = self.state.lock();
        if !state.confirmed {
            state.password = None;
        }
    }

    /// Whether a later `obtain` could still produce a new password.
    pub fn can_prompt(&self) -> bool {
        !self.state.lock().prompted
    }

    pub fn is_confirmed(&self) -> bool {
        self.state.lock().confirmed
    }

    pub fn has_password(&self) -> bool {
        self.state.lock().password.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(answer: Option<&'static str>) -> (Arc<AtomicUsize>, Arc<dyn CredentialProvider>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let provider = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            answer.map(str::to_string)
        };
        (calls, Arc::new(provider))
    }

    #[test]
    fn test_prompts_once_and_memoizes() {
        let (calls, provider) = counting(Some("secret"));
        let store = CredentialStore::new(None, provider);
        assert_eq!(store.obtain().as_deref(), Some("secret"));
        assert_eq!(store.obtain().as_deref(), Some("secret"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_initial_password_skips_prompt() {
        let (calls, provider) = counting(Some("other"));
        let store = CredentialStore::new(Some("given".into()), provider);
        assert_eq!(store.obtain().as_deref(), Some("given"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(store.can_prompt());
    }

    #[test]
    fn test_rejected_initial_password_prompts_exactly_once() {
        let (calls, provider) = counting(None);
        let store = CredentialStore::new(Some("wrong".into()), provider);
        store.reject();
        assert_eq!(store.obtain(), None);
        assert_eq!(store.obtain(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!store.can_prompt());
    }

    #[test]
    fn test_confirmed_password_survives_reject() {
        let (_, provider) = counting(None);
        let store = CredentialStore::new(Some("good".into()), provider);
        store.confirm();
        store.reject();
        assert!(store.is_confirmed());
        assert_eq!(store.obtain().as_deref(), Some("good"));
    }
}
