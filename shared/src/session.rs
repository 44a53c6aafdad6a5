use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, instrument};

use crate::api::{ApiConfig, BookListing, HttpAssetFetcher, LibraryApi, ReviewListing, UserListing};
use crate::asset::AssetPrefetcher;
use crate::coordinator::{MutationOutcome, SyncCoordinator};
use crate::cursor::FetchStatus;
use crate::error::SyncError;
use crate::http::HttpTransport;
use crate::model::{
    has_reviewed, Book, BookId, CreateReview, DeleteBook, Review, ReviewDraft, SetUserActive,
    User, UserId,
};
use crate::source::CredentialProvider;

pub type BookCoordinator<T, C> = SyncCoordinator<Book, BookListing<Arc<T>, C>>;
pub type UserCoordinator<T, C> = SyncCoordinator<User, UserListing<Arc<T>, C>>;
pub type ReviewCoordinator<T, C> = SyncCoordinator<Review, ReviewListing<Arc<T>, C>>;

/// The collections one signed-in user works with: the library's books, its
/// users, and per-book reviews, plus the cover-image prefetcher.
pub struct LibrarySession<T, C> {
    api: LibraryApi<Arc<T>, C>,
    books: BookCoordinator<T, C>,
    users: UserCoordinator<T, C>,
    reviews: Mutex<HashMap<BookId, Arc<ReviewCoordinator<T, C>>>>,
    covers: AssetPrefetcher<HttpAssetFetcher<Arc<T>>>,
}

impl<T, C> LibrarySession<T, C>
where
    T: HttpTransport + 'static,
    C: CredentialProvider + 'static,
{
    pub fn new(transport: Arc<T>, credentials: C, config: ApiConfig) -> Self {
        let covers = AssetPrefetcher::new(
            HttpAssetFetcher::new(Arc::clone(&transport), config.sync().clone()),
            config.sync(),
        );
        let api = LibraryApi::new(transport, credentials, config);
        Self {
            books: SyncCoordinator::new("books", api.books()),
            users: SyncCoordinator::new("users", api.users()),
            reviews: Mutex::new(HashMap::new()),
            covers,
            api,
        }
    }

    #[must_use]
    pub fn books(&self) -> &BookCoordinator<T, C> {
        &self.books
    }

    #[must_use]
    pub fn users(&self) -> &UserCoordinator<T, C> {
        &self.users
    }

    #[must_use]
    pub fn covers(&self) -> &AssetPrefetcher<HttpAssetFetcher<Arc<T>>> {
        &self.covers
    }

    /// Fetch the next page of books and start prefetching their covers.
    pub async fn load_more_books(&self) -> Result<FetchStatus, SyncError> {
        let status = self.books.fetch_next_page().await?;
        if matches!(status, FetchStatus::Fetched { .. }) {
            self.prefetch_covers();
        }
        Ok(status)
    }

    /// Reload books from the first page. Covers are prefetched only when the
    /// reload produced a page.
    pub async fn refresh_books(&self) -> Result<FetchStatus, SyncError> {
        let status = self.books.refresh().await?;
        if matches!(status, FetchStatus::Fetched { .. }) {
            self.prefetch_covers();
        }
        Ok(status)
    }

    pub async fn load_more_users(&self) -> Result<FetchStatus, SyncError> {
        self.users.fetch_next_page().await
    }

    pub async fn refresh_users(&self) -> Result<FetchStatus, SyncError> {
        self.users.refresh().await
    }

    /// Flip a user's active flag locally and confirm it with the server.
    #[instrument(skip(self))]
    pub async fn set_user_active(
        &self,
        user_id: UserId,
        is_active: bool,
    ) -> Result<MutationOutcome<User, SetUserActive>, SyncError> {
        let user = self.users.get(&user_id).ok_or_else(|| SyncError::NotFound {
            key: user_id.to_string(),
        })?;
        let change = SetUserActive::for_user(&user, is_active);
        let local = change.clone();
        self.users
            .apply(&user_id, move |u| local.apply_to(u), self.api.clone(), change)
            .await
    }

    pub async fn delete_book(
        &self,
        book_id: BookId,
    ) -> Result<MutationOutcome<Book, DeleteBook>, SyncError> {
        self.books
            .apply_delete(&book_id, self.api.clone(), DeleteBook { book_id })
            .await
    }

    /// The review collection for one book, created on first use.
    #[must_use]
    pub fn reviews(&self, book_id: BookId) -> Arc<ReviewCoordinator<T, C>> {
        let mut reviews = self.reviews.lock().unwrap_or_else(PoisonError::into_inner);
        let coordinator = reviews.entry(book_id).or_insert_with(|| {
            Arc::new(SyncCoordinator::new(
                format!("reviews:{book_id}"),
                self.api.reviews(book_id),
            ))
        });
        Arc::clone(coordinator)
    }

    /// Whether `user_id` may still write a review for `book_id`, judged on
    /// the reviews loaded so far.
    #[must_use]
    pub fn can_review(&self, book_id: BookId, user_id: &UserId) -> bool {
        !has_reviewed(self.reviews(book_id).snapshot().iter(), user_id)
    }

    /// Show the review immediately and submit it. A user gets one review per
    /// book.
    #[instrument(skip(self, draft), fields(book_id = %draft.book_id()))]
    pub async fn submit_review(
        &self,
        user_id: UserId,
        draft: ReviewDraft,
    ) -> Result<MutationOutcome<Review, CreateReview>, SyncError> {
        let reviews = self.reviews(draft.book_id());
        if has_reviewed(reviews.snapshot().iter(), &user_id) {
            return Err(SyncError::AlreadyExists {
                key: format!("{}/{user_id}", draft.book_id()),
            });
        }
        let placeholder = Review::pending(&draft, user_id);
        reviews
            .apply_insert(placeholder, self.api.clone(), CreateReview { draft })
            .await
    }

    fn prefetch_covers(&self) {
        let locators: Vec<_> = self
            .books
            .snapshot()
            .iter()
            .filter_map(Book::cover_locator)
            .collect();
        let started = self.covers.prefetch_all(&locators).len();
        if started > 0 {
            info!(started, "cover prefetch started");
        }
    }
}
