//! Authenticated user session, supplied by the application's sign-in flow

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Opaque identity token produced by the external sign-in flow
#[derive(Clone, PartialEq, Eq)]
pub struct SessionHandle(String);

impl SessionHandle {
    pub fn new(token: impl Into<String>) -> Self {
        SessionHandle(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionHandle(<opaque>)")
    }
}

/// Source of the current authenticated session.
///
/// Every storage call asks the provider first and refuses to touch the
/// remote store when no session is present.
pub trait SessionProvider: Send + Sync {
    fn current(&self) -> Option<SessionHandle>;
}

/// Settable identity, updated by the application on sign-in and sign-out
#[derive(Clone, Default)]
pub struct SharedIdentity {
    handle: Arc<RwLock<Option<SessionHandle>>>,
}

impl SharedIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity that is already signed in
    pub fn signed_in(handle: SessionHandle) -> Self {
        let identity = Self::new();
        identity.sign_in(handle);
        identity
    }

    pub fn sign_in(&self, handle: SessionHandle) {
        *self.handle.write() = Some(handle);
    }

    pub fn sign_out(&self) {
        *self.handle.write() = None;
    }
}

impl SessionProvider for SharedIdentity {
    fn current(&self) -> Option<SessionHandle> {
        self.handle.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_in_and_out() {
        let identity = SharedIdentity::new();
        assert!(identity.current().is_none());

        identity.sign_in(SessionHandle::new("token-123"));
        assert_eq!(identity.current().unwrap().token(), "token-123");

        identity.sign_out();
        assert!(identity.current().is_none());
    }

    #[test]
    fn test_handle_debug_is_opaque() {
        let rendered = format!("{:?}", SessionHandle::new("secret-token"));
        assert!(!rendered.contains("secret-token"));
    }
}
