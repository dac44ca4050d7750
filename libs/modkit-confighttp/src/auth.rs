use async_trait::async_trait;
use http::{Extensions, HeaderMap};

use crate::client::Transport;
use crate::error::AuthError;

/// Client-side authenticator: decorates the transport so that every
/// outgoing request carries credentials.
pub trait ClientAuthenticator: Send + Sync {
    /// Returns a transport that authenticates requests and then delegates
    /// to `transport`.
    ///
    /// # Errors
    /// Any error aborts client construction.
    fn wrap_transport(&self, transport: Transport) -> Result<Transport, AuthError>;
}

/// Server-side authenticator invoked once per inbound request.
#[async_trait]
pub trait ServerAuthenticator: Send + Sync {
    /// Checks `headers` and returns the request extensions the rest of the
    /// chain should see.
    ///
    /// # Errors
    /// Any error rejects the request with `401 Unauthorized`.
    async fn authenticate(
        &self,
        extensions: Extensions,
        headers: &HeaderMap,
    ) -> Result<Extensions, AuthError>;
}

/// [`ServerAuthenticator`] backed by a plain function.
pub struct ServerAuthenticatorFn<F> {
    f: F,
}

impl<F> ServerAuthenticatorFn<F>
where
    F: Fn(Extensions, &HeaderMap) -> Result<Extensions, AuthError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ServerAuthenticator for ServerAuthenticatorFn<F>
where
    F: Fn(Extensions, &HeaderMap) -> Result<Extensions, AuthError> + Send + Sync,
{
    async fn authenticate(
        &self,
        extensions: Extensions,
        headers: &HeaderMap,
    ) -> Result<Extensions, AuthError> {
        (self.f)(extensions, headers)
    }
}
