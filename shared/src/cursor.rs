use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque continuation marker handed back by a listing endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageToken(String);

impl PageToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One batch of entities from a listing endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page<E> {
    pub items: Vec<E>,
    pub next_token: Option<PageToken>,
    pub is_last: bool,
}

impl<E> Page<E> {
    /// A page followed by more data at `next`.
    pub fn more(items: Vec<E>, next: PageToken) -> Self {
        Self {
            items,
            next_token: Some(next),
            is_last: false,
        }
    }

    /// The final page of the collection.
    pub fn last(items: Vec<E>) -> Self {
        Self {
            items,
            next_token: None,
            is_last: true,
        }
    }

    /// End of data: explicit flag, an empty page, or nowhere left to go.
    #[must_use]
    pub fn signals_end(&self) -> bool {
        self.is_last || self.items.is_empty() || self.next_token.is_none()
    }
}

/// Result of a `fetch_next_page` call that did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchStatus {
    /// A page was merged.
    Fetched { received: usize, exhausted: bool },
    /// Another fetch on this cursor is in flight; nothing was requested.
    AlreadyFetching,
    /// The collection has been fully fetched; nothing was requested.
    Exhausted,
    /// The page arrived after a reset and was dropped.
    Discarded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CursorPhase {
    Idle,
    Fetching,
    Exhausted,
}

/// Permission to run one page fetch, tied to the generation it started in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchTicket {
    generation: u64,
    token: Option<PageToken>,
}

impl FetchTicket {
    #[must_use]
    pub fn token(&self) -> Option<&PageToken> {
        self.token.as_ref()
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Fetch progress for one collection.
///
/// `Idle -> Fetching -> {Idle, Exhausted}`; `reset` returns to `Idle` from
/// anywhere and bumps the generation so in-flight results can be recognised
/// as stale.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PaginationCursor {
    next_token: Option<PageToken>,
    is_exhausted: bool,
    is_fetching: bool,
    generation: u64,
}

impl PaginationCursor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn next_token(&self) -> Option<&PageToken> {
        self.next_token.as_ref()
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.is_exhausted
    }

    #[must_use]
    pub fn is_fetching(&self) -> bool {
        self.is_fetching
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn phase(&self) -> CursorPhase {
        if self.is_fetching {
            CursorPhase::Fetching
        } else if self.is_exhausted {
            CursorPhase::Exhausted
        } else {
            CursorPhase::Idle
        }
    }

    /// Enter `Fetching`, or report why no fetch should start.
    pub fn begin(&mut self) -> Result<FetchTicket, FetchStatus> {
        if self.is_fetching {
            return Err(FetchStatus::AlreadyFetching);
        }
        if self.is_exhausted {
            return Err(FetchStatus::Exhausted);
        }
        self.is_fetching = true;
        Ok(FetchTicket {
            generation: self.generation,
            token: self.next_token.clone(),
        })
    }

    /// Record a successful fetch. Returns `false` without touching anything if
    /// the ticket predates the last reset.
    pub fn complete(
        &mut self,
        ticket: &FetchTicket,
        next_token: Option<PageToken>,
        exhausted: bool,
    ) -> bool {
        if ticket.generation != self.generation {
            return false;
        }
        self.next_token = next_token;
        self.is_exhausted = exhausted;
        self.is_fetching = false;
        true
    }

    /// Record a failed fetch. The token is left where it was so the next call
    /// retries the same page.
    pub fn fail(&mut self, ticket: &FetchTicket) -> bool {
        if ticket.generation != self.generation {
            return false;
        }
        self.is_fetching = false;
        true
    }

    pub fn reset(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.next_token = None;
        self.is_exhausted = false;
        self.is_fetching = false;
    }
}
