//! Shared administrative secret.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Why an administrative request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdminAuthError {
    /// No administrative secret is configured; the admin surface is off.
    #[error("administrative access is not configured")]
    NotConfigured,

    /// The request carried no administrative secret.
    #[error("administrative key is required")]
    Missing,

    /// The presented secret does not match.
    #[error("administrative key is invalid")]
    Invalid,
}

/// The single shared secret guarding the administrative surface.
#[derive(Clone, Default)]
pub struct AdminSecret(Option<SecretString>);

impl AdminSecret {
    /// Wraps a configured secret. An empty value leaves the surface disabled.
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if secret.trim().is_empty() {
            return Self(None);
        }
        Self(Some(SecretString::from(secret)))
    }

    /// Reads the secret from the environment variable `var`.
    #[must_use]
    pub fn from_env(var: &str) -> Self {
        std::env::var(var).map_or_else(|_| Self::default(), Self::new)
    }

    /// Returns `true` if a secret is configured.
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.0.is_some()
    }

    /// Checks a presented secret in constant time.
    ///
    /// # Errors
    ///
    /// Returns [`AdminAuthError`] describing the refusal.
    pub fn verify(&self, presented: Option<&str>) -> Result<(), AdminAuthError> {
        let expected = self.0.as_ref().ok_or(AdminAuthError::NotConfigured)?;
        let presented = presented
            .filter(|p| !p.is_empty())
            .ok_or(AdminAuthError::Missing)?;

        let expected = expected.expose_secret().as_bytes();
        let presented = presented.as_bytes();
        // Length is not secret; ct_eq on slices of different length is false.
        if bool::from(expected.ct_eq(presented)) {
            Ok(())
        } else {
            Err(AdminAuthError::Invalid)
        }
    }
}

impl fmt::Debug for AdminSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminSecret")
            .field("configured", &self.is_configured())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_refuses_everything() {
        let secret = AdminSecret::new("  ");
        assert!(!secret.is_configured());
        assert_eq!(
            secret.verify(Some("anything")),
            Err(AdminAuthError::NotConfigured)
        );
    }

    #[test]
    fn test_verify() {
        let secret = AdminSecret::new("s3cret-admin");
        assert_eq!(secret.verify(Some("s3cret-admin")), Ok(()));
        assert_eq!(secret.verify(Some("s3cret-admiN")), Err(AdminAuthError::Invalid));
        assert_eq!(secret.verify(Some("s3cret")), Err(AdminAuthError::Invalid));
        assert_eq!(secret.verify(Some("")), Err(AdminAuthError::Missing));
        assert_eq!(secret.verify(None), Err(AdminAuthError::Missing));
    }

    #[test]
    fn test_debug_does_not_leak() {
        let secret = AdminSecret::new("s3cret-admin");
        let shown = format!("{secret:?}");
        assert!(!shown.contains("s3cret"));
    }
}
