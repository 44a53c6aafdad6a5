//! Collaborator contracts consumed by the coordinator and the prefetcher.
//!
//! None of these are implemented by the sync core itself; the REST adapters in
//! [`crate::api`] and the test doubles provide them.

use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::sync::Arc;

use crate::asset::AssetLocator;
use crate::cursor::{Page, PageToken};
use crate::entity::Entity;
use crate::error::{CredentialError, RemoteError};

/// Paginated listing endpoint. `None` requests the first page.
#[async_trait::async_trait]
pub trait RemoteCollectionSource<E: Entity>: Send + Sync {
    async fn fetch_page(&self, token: Option<&PageToken>) -> Result<Page<E>, RemoteError>;
}

/// A remote write whose effect has already been applied locally.
///
/// `Ok(Some(server_copy))` carries server-assigned fields to fold back into
/// the cache; `Ok(None)` means the local value stands as is.
#[async_trait::async_trait]
pub trait RemoteMutation<E: Entity>: Send + Sync {
    type Descriptor: fmt::Debug + Send + Sync;

    async fn execute(&self, descriptor: &Self::Descriptor) -> Result<Option<E>, RemoteError>;
}

#[async_trait::async_trait]
impl<E: Entity, M: RemoteMutation<E> + ?Sized> RemoteMutation<E> for Arc<M> {
    type Descriptor = M::Descriptor;

    async fn execute(&self, descriptor: &Self::Descriptor) -> Result<Option<E>, RemoteError> {
        (**self).execute(descriptor).await
    }
}

/// Supplies the bearer token for outgoing requests. Never cached by the core.
pub trait CredentialProvider: Send + Sync {
    fn current_token(&self) -> Result<SecretString, CredentialError>;
}

/// Raw byte fetch for cover images and similar assets.
#[async_trait::async_trait]
pub trait AssetFetcher: Send + Sync + 'static {
    async fn fetch(&self, locator: &AssetLocator) -> Result<Bytes, RemoteError>;
}

/// Fixed token, for hosts that resolve credentials up front.
pub struct StaticCredentials(Option<SecretString>);

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(SecretString::new(token.into())))
    }

    #[must_use]
    pub fn signed_out() -> Self {
        Self(None)
    }
}

impl CredentialProvider for StaticCredentials {
    fn current_token(&self) -> Result<SecretString, CredentialError> {
        self.0
            .as_ref()
            .map(|token| SecretString::new(token.expose_secret().clone()))
            .ok_or(CredentialError::NotAuthenticated)
    }
}
