// lib.rs - paginated sync and optimistic mutation core for the library client

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod asset;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod entity;
pub mod error;
pub mod http;
pub mod lock;
pub mod model;
pub mod session;
pub mod source;

pub use api::{ApiConfig, HttpAssetFetcher, LibraryApi};
pub use asset::{AssetError, AssetLocator, AssetPrefetcher, AssetState};
pub use cache::{CollectionCache, MergeStats};
pub use config::{ConfigError, SyncConfig};
pub use coordinator::{MutationKind, MutationOutcome, Reconciliation, SyncCoordinator};
pub use cursor::{FetchStatus, Page, PageToken, PaginationCursor};
pub use entity::Entity;
pub use error::{CredentialError, FailureClass, RemoteError, SyncError};
pub use http::{HttpError, HttpRequest, HttpResponse, HttpTransport};
pub use session::LibrarySession;
pub use source::{
    AssetFetcher, CredentialProvider, RemoteCollectionSource, RemoteMutation, StaticCredentials,
};
