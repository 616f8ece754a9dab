use std::collections::BTreeMap;

use async_trait::async_trait;
use restkit_http::BoxError;
use restkit_utils::SecretString;
use time::OffsetDateTime;

/// Bearer token issued by a [`TokenCredential`]. `Debug` redacts the token.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: SecretString,
    pub expires_on: OffsetDateTime,
    /// When the issuer recommends refreshing; overrides the default window
    pub refresh_on: Option<OffsetDateTime>,
}

impl AccessToken {
    #[must_use]
    pub fn new(token: impl Into<SecretString>, expires_on: OffsetDateTime) -> Self {
        Self {
            token: token.into(),
            expires_on,
            refresh_on: None,
        }
    }

    #[must_use]
    pub fn with_refresh_on(mut self, refresh_on: OffsetDateTime) -> Self {
        self.refresh_on = Some(refresh_on);
        self
    }
}

/// What to ask the credential for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenRequestOptions {
    pub scopes: Vec<String>,
    /// Decoded claims from a CAE challenge (a JSON document)
    pub claims: Option<String>,
    /// Request a token that supports continuous access evaluation
    pub enable_cae: bool,
    pub tenant_id: Option<String>,
    /// Extra challenge parameters, such as `realm` and `service` for registries
    pub challenge_parameters: BTreeMap<String, String>,
}

impl TokenRequestOptions {
    #[must_use]
    pub fn for_scopes<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scopes: scopes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// Source of bearer tokens, supplied by the caller's environment
#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Acquire a token for `options`.
    ///
    /// # Errors
    /// Any failure; the auth policies surface it as a non-retriable
    /// [`AuthError::Credential`](crate::AuthError::Credential).
    async fn get_token(&self, options: &TokenRequestOptions) -> Result<AccessToken, BoxError>;
}

/// Credential that always returns the same token.
///
/// For local emulators and tests.
#[derive(Clone)]
pub struct StaticTokenCredential {
    token: SecretString,
    expires_on: OffsetDateTime,
}

impl StaticTokenCredential {
    #[must_use]
    pub fn new(token: impl Into<SecretString>, expires_on: OffsetDateTime) -> Self {
        Self {
            token: token.into(),
            expires_on,
        }
    }
}

#[async_trait]
impl TokenCredential for StaticTokenCredential {
    async fn get_token(&self, _options: &TokenRequestOptions) -> Result<AccessToken, BoxError> {
        Ok(AccessToken::new(self.token.clone(), self.expires_on))
    }
}
