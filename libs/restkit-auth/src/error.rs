use restkit_http::{BoxError, HttpError};
use thiserror::Error;

/// Failures raised by the authentication policies.
///
/// None of these are worth retrying, so every variant reaches the pipeline as
/// [`HttpError::NonRetriable`]. Messages never include token values.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// The credential could not produce a token
    #[error("credential failed to acquire a token: {0}")]
    Credential(#[source] BoxError),

    /// A token would have been sent over plain HTTP
    #[error("authenticated requests are not permitted for non TLS protected (https) endpoints")]
    HttpsRequired,

    /// `WWW-Authenticate` could not be used to re-authenticate
    #[error("invalid authentication challenge: {0}")]
    InvalidChallenge(String),

    /// An [`AuthorizationHandler`](crate::AuthorizationHandler) hook failed
    #[error("authorization handler: {0}")]
    Handler(#[source] BoxError),
}

impl From<AuthError> for HttpError {
    fn from(err: AuthError) -> Self {
        HttpError::non_retriable(err)
    }
}
