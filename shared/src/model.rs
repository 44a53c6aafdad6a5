use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;
use uuid::Uuid;

use crate::asset::AssetLocator;
use crate::entity::Entity;

pub const MAX_REVIEW_COMMENT_CHARS: usize = 500;
pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

// `None` only if the pattern fails to compile, in which case no address passes.
static EMAIL_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[A-Z0-9a-z._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,64}$").ok()
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("rating must be between {MIN_RATING} and {MAX_RATING}, got {0}")]
    RatingOutOfRange(u8),

    #[error("review comment cannot be empty")]
    EmptyComment,

    #[error("value too long ({len} > {max})")]
    TooLong { len: usize, max: usize },

    #[error("name cannot be empty")]
    EmptyName,

    #[error("not a valid email address: {0}")]
    InvalidEmail(String),

    #[error("not a valid library id: {0}")]
    InvalidLibraryId(String),
}

macro_rules! entity_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            #[must_use]
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

entity_id!(BookId);
entity_id!(UserId);
entity_id!(ReviewId);
entity_id!(LibraryId);

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Book {
    pub id: BookId,
    pub library_id: LibraryId,
    pub title: String,
    #[serde(default)]
    pub isbn: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author_names: Vec<String>,
    #[serde(default)]
    pub genre_names: Vec<String>,
    #[serde(default)]
    pub total_copies: u32,
    #[serde(default)]
    pub available_copies: u32,
    #[serde(default)]
    pub reserved_copies: u32,
    #[serde(default)]
    pub published_date: Option<String>,
    #[serde(default)]
    pub cover_image_url: Option<String>,
}

impl Book {
    /// Locator for the cover image, if the book has a usable one.
    #[must_use]
    pub fn cover_locator(&self) -> Option<AssetLocator> {
        self.cover_image_url
            .as_deref()
            .and_then(|url| AssetLocator::parse(url).ok())
    }

    /// Case-insensitive search on title and ISBN. An empty query matches.
    #[must_use]
    pub fn matches(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return true;
        }
        self.title.to_lowercase().contains(&query)
            || self
                .isbn
                .as_deref()
                .is_some_and(|isbn| isbn.to_lowercase().contains(&query))
    }

    /// Whether the book is tagged with `genre`, ignoring case and surrounding
    /// whitespace.
    #[must_use]
    pub fn in_genre(&self, genre: &str) -> bool {
        let genre = genre.trim();
        self.genre_names
            .iter()
            .any(|g| g.trim().eq_ignore_ascii_case(genre))
    }
}

impl Entity for Book {
    type Key = BookId;

    fn key(&self) -> BookId {
        self.id
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Librarian,
    Member,
    Admin,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub role: UserRole,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub library_id: Option<LibraryId>,
}

impl User {
    #[must_use]
    pub fn with_active(&self, is_active: bool) -> Self {
        Self {
            is_active,
            ..self.clone()
        }
    }
}

impl Entity for User {
    type Key = UserId;

    fn key(&self) -> UserId {
        self.id
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Review {
    pub id: ReviewId,
    pub user_id: UserId,
    pub book_id: BookId,
    pub rating: u8,
    pub comment: String,
    /// Server timestamp; absent until the review has been accepted.
    #[serde(default)]
    pub reviewed_at: Option<String>,
}

impl Review {
    /// Local placeholder shown while a [`CreateReview`] is in flight.
    #[must_use]
    pub fn pending(draft: &ReviewDraft, user_id: UserId) -> Self {
        Self {
            id: ReviewId::generate(),
            user_id,
            book_id: draft.book_id,
            rating: draft.rating,
            comment: draft.comment.clone(),
            reviewed_at: None,
        }
    }
}

impl Entity for Review {
    type Key = ReviewId;

    fn key(&self) -> ReviewId {
        self.id
    }
}

/// A review the user is about to submit. Only constructible in valid form.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ReviewDraft {
    book_id: BookId,
    rating: u8,
    comment: String,
}

impl ReviewDraft {
    pub fn new(book_id: BookId, rating: u8, comment: &str) -> Result<Self, ValidationError> {
        if !(MIN_RATING..=MAX_RATING).contains(&rating) {
            return Err(ValidationError::RatingOutOfRange(rating));
        }
        let comment = comment.trim();
        if comment.is_empty() {
            return Err(ValidationError::EmptyComment);
        }
        let len = comment.chars().count();
        if len > MAX_REVIEW_COMMENT_CHARS {
            return Err(ValidationError::TooLong {
                len,
                max: MAX_REVIEW_COMMENT_CHARS,
            });
        }
        Ok(Self {
            book_id,
            rating,
            comment: comment.to_string(),
        })
    }

    #[must_use]
    pub fn book_id(&self) -> BookId {
        self.book_id
    }

    #[must_use]
    pub fn rating(&self) -> u8 {
        self.rating
    }

    #[must_use]
    pub fn comment(&self) -> &str {
        &self.comment
    }
}

/// An account the user is about to create. Only constructible in valid form.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct NewUser {
    name: String,
    email: String,
    role: UserRole,
    library_id: LibraryId,
}

impl NewUser {
    pub fn new(
        name: &str,
        email: &str,
        role: UserRole,
        library_id: &str,
    ) -> Result<Self, ValidationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        let email = email.trim();
        if !is_valid_email(email) {
            return Err(ValidationError::InvalidEmail(email.to_string()));
        }
        let library_id = Uuid::parse_str(library_id.trim())
            .map(LibraryId)
            .map_err(|_| ValidationError::InvalidLibraryId(library_id.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            email: email.to_string(),
            role,
            library_id,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn email(&self) -> &str {
        &self.email
    }

    #[must_use]
    pub fn role(&self) -> UserRole {
        self.role
    }

    #[must_use]
    pub fn library_id(&self) -> LibraryId {
        self.library_id
    }

    /// The account as it is shown locally before the server assigns an id.
    #[must_use]
    pub fn into_user(self) -> User {
        User {
            id: UserId::generate(),
            email: self.email,
            name: self.name,
            role: self.role,
            is_active: true,
            library_id: Some(self.library_id),
        }
    }
}

#[must_use]
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(email))
}

// --- Mutation descriptors ---

/// Activate or deactivate a user account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetUserActive {
    pub user_id: UserId,
    pub name: String,
    pub role: UserRole,
    pub is_active: bool,
}

impl SetUserActive {
    #[must_use]
    pub fn for_user(user: &User, is_active: bool) -> Self {
        Self {
            user_id: user.id,
            name: user.name.clone(),
            role: user.role,
            is_active,
        }
    }

    /// The local change this descriptor stands for.
    #[must_use]
    pub fn apply_to(&self, user: &User) -> User {
        user.with_active(self.is_active)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteBook {
    pub book_id: BookId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateReview {
    pub draft: ReviewDraft,
}

// --- Queries ---

pub fn users_with_role(users: &[User], role: UserRole) -> Vec<&User> {
    users.iter().filter(|u| u.role == role).collect()
}

/// Books tagged with `genre`; every book when no genre is selected.
pub fn books_in_genre<'a>(books: &'a [Book], genre: Option<&str>) -> Vec<&'a Book> {
    match genre {
        Some(genre) => books.iter().filter(|b| b.in_genre(genre)).collect(),
        None => books.iter().collect(),
    }
}

/// Whether `user_id` already has a review among `reviews`. Gates the
/// "write review" action.
pub fn has_reviewed<'a>(reviews: impl IntoIterator<Item = &'a Review>, user_id: &UserId) -> bool {
    reviews.into_iter().any(|r| r.user_id == *user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: UserRole, is_active: bool) -> User {
        User {
            id: UserId::generate(),
            email: "reader@example.com".into(),
            name: "Reader".into(),
            role,
            is_active,
            library_id: None,
        }
    }

    #[test]
    fn test_review_draft_validation() {
        let book = BookId::generate();
        assert_eq!(
            ReviewDraft::new(book, 0, "fine"),
            Err(ValidationError::RatingOutOfRange(0))
        );
        assert_eq!(
            ReviewDraft::new(book, 6, "fine"),
            Err(ValidationError::RatingOutOfRange(6))
        );
        assert_eq!(ReviewDraft::new(book, 3, "   "), Err(ValidationError::EmptyComment));
        assert!(matches!(
            ReviewDraft::new(book, 3, &"é".repeat(MAX_REVIEW_COMMENT_CHARS + 1)),
            Err(ValidationError::TooLong { .. })
        ));

        let draft = ReviewDraft::new(book, 5, "  Loved it  ").unwrap();
        assert_eq!(draft.comment(), "Loved it");
        assert!(ReviewDraft::new(book, 1, &"é".repeat(MAX_REVIEW_COMMENT_CHARS)).is_ok());
    }

    #[test]
    fn test_user_json_shape() {
        let json = r#"{
            "id": "6f1c7b2e-2a47-4d6c-9a38-1d2f5b8c9e01",
            "email": "lib@example.com",
            "name": "Ada",
            "role": "librarian",
            "is_active": false
        }"#;
        let user: User = serde_json::from_str(json).unwrap();
        assert_eq!(user.role, UserRole::Librarian);
        assert!(!user.is_active);
        assert!(user.library_id.is_none());
    }

    #[test]
    fn test_set_user_active_applies_only_flag() {
        let original = user(UserRole::Member, false);
        let change = SetUserActive::for_user(&original, true);
        let updated = change.apply_to(&original);

        assert!(updated.is_active);
        assert_eq!(updated.id, original.id);
        assert_eq!(updated.name, original.name);
    }

    #[test]
    fn test_users_with_role() {
        let users = vec![
            user(UserRole::Librarian, true),
            user(UserRole::Member, true),
            user(UserRole::Librarian, false),
        ];
        assert_eq!(users_with_role(&users, UserRole::Librarian).len(), 2);
        assert_eq!(users_with_role(&users, UserRole::Admin).len(), 0);
    }

    #[test]
    fn test_has_reviewed() {
        let me = UserId::generate();
        let draft = ReviewDraft::new(BookId::generate(), 4, "Good").unwrap();
        let reviews = vec![Review::pending(&draft, UserId::generate())];
        assert!(!has_reviewed(&reviews, &me));

        let mine = Review::pending(&draft, me);
        assert!(has_reviewed(reviews.iter().chain([&mine]), &me));
    }

    fn book(title: &str, genres: &[&str]) -> Book {
        Book {
            id: BookId::generate(),
            library_id: LibraryId::generate(),
            title: title.into(),
            isbn: None,
            description: None,
            author_names: vec![],
            genre_names: genres.iter().map(|g| (*g).to_string()).collect(),
            total_copies: 1,
            available_copies: 1,
            reserved_copies: 0,
            published_date: None,
            cover_image_url: None,
        }
    }

    #[test]
    fn test_books_in_genre() {
        let books = vec![
            book("Dune", &["Science Fiction", "Classics"]),
            book("Emma", &["Romance", "Classics"]),
            book("Neuromancer", &[" science fiction "]),
        ];

        let titles = |found: Vec<&Book>| -> Vec<String> {
            found.iter().map(|b| b.title.clone()).collect()
        };
        assert_eq!(
            titles(books_in_genre(&books, Some("science FICTION"))),
            vec!["Dune", "Neuromancer"]
        );
        assert_eq!(titles(books_in_genre(&books, Some("Classics"))), vec!["Dune", "Emma"]);
        assert!(books_in_genre(&books, Some("Horror")).is_empty());
        assert_eq!(books_in_genre(&books, None).len(), 3);
        assert!(!books[0].in_genre("Science"));
    }

    #[test]
    fn test_new_user_validation() {
        let library = "7d9f2a4e-0000-4000-8000-000000000001";
        assert_eq!(
            NewUser::new("  ", "ada@example.com", UserRole::Member, library),
            Err(ValidationError::EmptyName)
        );
        for bad in ["ada", "ada@example", "ada@example.c", "@example.com", "ada @example.com"] {
            assert_eq!(
                NewUser::new("Ada", bad, UserRole::Member, library),
                Err(ValidationError::InvalidEmail(bad.to_string())),
                "{bad} should be rejected"
            );
        }
        assert!(matches!(
            NewUser::new("Ada", "ada@example.com", UserRole::Member, "library-1"),
            Err(ValidationError::InvalidLibraryId(_))
        ));

        let email = " ada.l+books@mail.example.org ";
        let draft = NewUser::new(" Ada ", email, UserRole::Librarian, library).unwrap();
        assert_eq!(draft.name(), "Ada");
        assert_eq!(draft.email(), "ada.l+books@mail.example.org");
        assert_eq!(draft.library_id().to_string(), library);

        let user = draft.clone().into_user();
        assert!(user.is_active);
        assert_eq!(user.role, UserRole::Librarian);
        assert_eq!(user.library_id, Some(draft.library_id()));
    }

    #[test]
    fn test_book_search_and_cover() {
        let book = Book {
            id: BookId::generate(),
            library_id: LibraryId::generate(),
            title: "The Left Hand of Darkness".into(),
            isbn: Some("9780441478125".into()),
            description: None,
            author_names: vec!["Ursula K. Le Guin".into()],
            genre_names: vec![],
            total_copies: 3,
            available_copies: 1,
            reserved_copies: 0,
            published_date: None,
            cover_image_url: Some("https://covers.example.com/lhod.jpg".into()),
        };

        assert!(book.matches("left hand"));
        assert!(book.matches("0441"));
        assert!(book.matches(""));
        assert!(!book.matches("dune"));
        assert!(book.cover_locator().is_some());

        let no_cover = Book {
            cover_image_url: Some("not a url".into()),
            ..book
        };
        assert!(no_cover.cover_locator().is_none());
    }
}
