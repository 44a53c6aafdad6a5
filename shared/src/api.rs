//! REST adapters for the library-management API.
//!
//! Listing endpoints use page-number pagination: the [`PageToken`] is the
//! decimal page number and the first page is `1`.

use bytes::Bytes;
use metrics::counter;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::asset::AssetLocator;
use crate::config::{ConfigError, SyncConfig};
use crate::cursor::{Page, PageToken};
use crate::error::RemoteError;
use crate::http::{validate_url, HttpMethod, HttpRequest, HttpResponse, HttpTransport};
use crate::model::{Book, BookId, CreateReview, DeleteBook, Review, SetUserActive, User, UserRole};
use crate::source::{AssetFetcher, CredentialProvider, RemoteCollectionSource, RemoteMutation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    base_url: Url,
    sync: SyncConfig,
}

impl ApiConfig {
    /// `base_url` is the API root, e.g. `https://host/lms/api/v1`.
    pub fn new(base_url: &str, sync: SyncConfig) -> Result<Self, ConfigError> {
        let base_url = validate_url(base_url).map_err(|e| ConfigError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ConfigError::InvalidBaseUrl {
                url: base_url.to_string(),
                reason: "cannot be used as a base".to_string(),
            });
        }
        sync.validate()?;
        Ok(Self { base_url, sync })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn sync(&self) -> &SyncConfig {
        &self.sync
    }
}

struct ApiInner<T, C> {
    transport: T,
    credentials: C,
    config: ApiConfig,
}

/// Authenticated client for the listing and mutation endpoints.
///
/// Cheap to clone; the listing sources hold their own clone.
pub struct LibraryApi<T, C> {
    inner: Arc<ApiInner<T, C>>,
}

impl<T, C> Clone for LibraryApi<T, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListBody<E> {
    Envelope {
        data: Vec<E>,
        #[serde(default)]
        pagination: Option<Pagination>,
    },
    Bare(Vec<E>),
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct Pagination {
    page: u32,
    total_pages: u32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Returned<E> {
    Wrapped { data: E },
    Bare(E),
}

#[derive(Serialize)]
struct UserStatusBody<'a> {
    name: &'a str,
    is_active: bool,
    role: UserRole,
}

impl<T: HttpTransport, C: CredentialProvider> LibraryApi<T, C> {
    pub fn new(transport: T, credentials: C, config: ApiConfig) -> Self {
        Self {
            inner: Arc::new(ApiInner {
                transport,
                credentials,
                config,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ApiConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn books(&self) -> BookListing<T, C> {
        BookListing { api: self.clone() }
    }

    #[must_use]
    pub fn users(&self) -> UserListing<T, C> {
        UserListing { api: self.clone() }
    }

    #[must_use]
    pub fn reviews(&self, book_id: BookId) -> ReviewListing<T, C> {
        ReviewListing {
            api: self.clone(),
            book_id,
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.inner.config.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| RemoteError::permanent("base url cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, method: HttpMethod, url: Url) -> Result<HttpRequest, RemoteError> {
        let token = self.inner.credentials.current_token()?;
        let request = HttpRequest::new(method, url)?
            .with_header("Authorization", format!("Bearer {}", token.expose_secret()))?
            .with_header("Accept", "application/json")?
            .with_timeout(self.inner.config.sync.request_timeout())?;
        Ok(request)
    }

    #[instrument(skip(self, request), fields(method = request.method().as_str(), url = %request.url(), request_id = request.request_id()))]
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, RemoteError> {
        counter!("api.requests", "method" => request.method().as_str()).increment(1);
        let result = match self.inner.transport.execute(request).await {
            Ok(response) => response.error_for_status(),
            Err(e) => Err(e.into()),
        };
        match &result {
            Ok(response) => debug!(status = response.status(), "request succeeded"),
            Err(e) => {
                counter!("api.failures").increment(1);
                warn!(error = %e, status = ?e.status, "request failed");
            }
        }
        result
    }

    async fn fetch_list<E: DeserializeOwned>(
        &self,
        segments: &[&str],
        token: Option<&PageToken>,
    ) -> Result<Page<E>, RemoteError> {
        let page = parse_page_token(token)?;
        let limit = self.inner.config.sync.page_size;

        let mut url = self.endpoint(segments)?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("limit", &limit.to_string());

        let response = self.send(self.authorized(HttpMethod::Get, url)?).await?;
        let body: ListBody<E> = response.json()?;
        Ok(into_page(body, page, limit))
    }
}

fn parse_page_token(token: Option<&PageToken>) -> Result<u32, RemoteError> {
    match token {
        None => Ok(1),
        Some(t) => t
            .as_str()
            .parse::<u32>()
            .ok()
            .filter(|&page| page >= 1)
            .ok_or_else(|| RemoteError::permanent(format!("invalid page token '{t}'"))),
    }
}

fn into_page<E>(body: ListBody<E>, page: u32, limit: u32) -> Page<E> {
    let (items, pagination) = match body {
        ListBody::Envelope { data, pagination } => (data, pagination),
        ListBody::Bare(data) => (data, None),
    };
    let is_last = match pagination {
        Some(p) => p.page >= p.total_pages,
        None => items.len() < limit as usize,
    };
    if is_last {
        Page::last(items)
    } else {
        Page::more(items, PageToken::new((page + 1).to_string()))
    }
}

/// Entity echoed back by a mutation endpoint, if the body holds one.
fn decode_returned<E: DeserializeOwned>(response: &HttpResponse) -> Option<E> {
    if response.body().is_empty() {
        return None;
    }
    match response.json::<Returned<E>>() {
        Ok(Returned::Wrapped { data } | Returned::Bare(data)) => Some(data),
        Err(e) => {
            warn!(error = %e, "mutation response carried no entity");
            None
        }
    }
}

pub struct BookListing<T, C> {
    api: LibraryApi<T, C>,
}

#[async_trait::async_trait]
impl<T: HttpTransport, C: CredentialProvider> RemoteCollectionSource<Book> for BookListing<T, C> {
    async fn fetch_page(&self, token: Option<&PageToken>) -> Result<Page<Book>, RemoteError> {
        self.api.fetch_list(&["books"], token).await
    }
}

pub struct UserListing<T, C> {
    api: LibraryApi<T, C>,
}

#[async_trait::async_trait]
impl<T: HttpTransport, C: CredentialProvider> RemoteCollectionSource<User> for UserListing<T, C> {
    async fn fetch_page(&self, token: Option<&PageToken>) -> Result<Page<User>, RemoteError> {
        self.api.fetch_list(&["users"], token).await
    }
}

pub struct ReviewListing<T, C> {
    api: LibraryApi<T, C>,
    book_id: BookId,
}

#[async_trait::async_trait]
impl<T: HttpTransport, C: CredentialProvider> RemoteCollectionSource<Review>
    for ReviewListing<T, C>
{
    async fn fetch_page(&self, token: Option<&PageToken>) -> Result<Page<Review>, RemoteError> {
        let book_id = self.book_id.to_string();
        self.api
            .fetch_list(&["books", &book_id, "reviews"], token)
            .await
    }
}

#[async_trait::async_trait]
impl<T: HttpTransport, C: CredentialProvider> RemoteMutation<User> for LibraryApi<T, C> {
    type Descriptor = SetUserActive;

    async fn execute(&self, descriptor: &SetUserActive) -> Result<Option<User>, RemoteError> {
        let url = self.endpoint(&["users", &descriptor.user_id.to_string()])?;
        let body = UserStatusBody {
            name: &descriptor.name,
            is_active: descriptor.is_active,
            role: descriptor.role,
        };
        let request = self.authorized(HttpMethod::Put, url)?.with_json(&body)?;
        let response = self.send(request).await?;
        Ok(decode_returned(&response))
    }
}

#[async_trait::async_trait]
impl<T: HttpTransport, C: CredentialProvider> RemoteMutation<Book> for LibraryApi<T, C> {
    type Descriptor = DeleteBook;

    async fn execute(&self, descriptor: &DeleteBook) -> Result<Option<Book>, RemoteError> {
        let url = self.endpoint(&["books", &descriptor.book_id.to_string()])?;
        self.send(self.authorized(HttpMethod::Delete, url)?).await?;
        Ok(None)
    }
}

#[async_trait::async_trait]
impl<T: HttpTransport, C: CredentialProvider> RemoteMutation<Review> for LibraryApi<T, C> {
    type Descriptor = CreateReview;

    async fn execute(&self, descriptor: &CreateReview) -> Result<Option<Review>, RemoteError> {
        let url = self.endpoint(&["reviews"])?;
        let request = self.authorized(HttpMethod::Post, url)?.with_json(&descriptor.draft)?;
        let response = self.send(request).await?;
        Ok(decode_returned(&response))
    }
}

/// Unauthenticated GET for cover images, capped at `max_asset_bytes`.
pub struct HttpAssetFetcher<T> {
    transport: T,
    config: SyncConfig,
}

impl<T: HttpTransport> HttpAssetFetcher<T> {
    pub fn new(transport: T, config: SyncConfig) -> Self {
        Self { transport, config }
    }
}

#[async_trait::async_trait]
impl<T: HttpTransport + 'static> AssetFetcher for HttpAssetFetcher<T> {
    async fn fetch(&self, locator: &AssetLocator) -> Result<Bytes, RemoteError> {
        let request = HttpRequest::new(HttpMethod::Get, locator.url().clone())?
            .with_timeout(self.config.request_timeout())?
            .with_max_response_size(self.config.max_asset_bytes);
        let body = self
            .transport
            .execute(request)
            .await?
            .error_for_status()?
            .into_body();
        if body.len() > self.config.max_asset_bytes {
            return Err(RemoteError::permanent(format!(
                "asset of {} bytes exceeds maximum of {}",
                body.len(),
                self.config.max_asset_bytes
            )));
        }
        Ok(body)
    }
}
