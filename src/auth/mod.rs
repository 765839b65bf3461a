//! # Relay Auth
//!
//! Static API keys checked on the ingress `start` and `send` operations.
//! Clients present a key in the `X-API-Key` header.

mod crypto;
mod errors;

pub use crypto::{constant_time_eq, digest_key, KeyDigest};
pub use errors::{AuthError, AuthResult};

/// Header carrying the client's API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// The set of accepted API keys
#[derive(Debug, Clone, Default)]
pub struct ApiKeyStore {
    digests: Vec<KeyDigest>,
}

impl ApiKeyStore {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            digests: keys
                .into_iter()
                .filter(|key| !key.as_ref().is_empty())
                .map(|key| digest_key(key.as_ref()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// Check a presented key
    pub fn verify(&self, presented: Option<&str>) -> AuthResult<()> {
        self.identify(presented).map(|_| ())
    }

    /// Digest of a presented key that matches a configured one
    ///
    /// Every configured digest is compared, so timing does not depend on
    /// which key matched.
    pub fn identify(&self, presented: Option<&str>) -> AuthResult<KeyDigest> {
        let presented = match presented {
            Some(key) if !key.is_empty() => key,
            _ => return Err(AuthError::MissingApiKey),
        };

        let candidate = digest_key(presented);
        let matched = self
            .digests
            .iter()
            .fold(false, |found, digest| constant_time_eq(digest, &candidate) | found);

        if matched {
            Ok(candidate)
        } else {
            Err(AuthError::InvalidApiKey)
        }
    }
}
