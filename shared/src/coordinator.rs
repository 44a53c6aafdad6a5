use metrics::{counter, histogram};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::cache::CollectionCache;
use crate::cursor::{FetchStatus, FetchTicket, PaginationCursor};
use crate::entity::Entity;
use crate::error::{RemoteError, SyncError};
use crate::lock::{KeyLease, MutationLocks};
use crate::source::{RemoteCollectionSource, RemoteMutation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Update,
    Delete,
    Insert,
}

/// What was undone after a remote mutation failed, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation<E: Entity, D> {
    pub key: E::Key,
    pub kind: MutationKind,
    /// The descriptor that was sent and rejected.
    pub attempted: D,
    /// The pre-mutation value. `None` for inserts, which had no prior value.
    pub snapshot: Option<E>,
    /// `false` when there was nothing left to restore into (the collection was
    /// refreshed while the call was in flight).
    pub restored: bool,
    pub error: RemoteError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome<E: Entity, D> {
    /// The remote call succeeded. `entity` is the value now cached under
    /// `key`, `None` after a delete.
    Committed { key: E::Key, entity: Option<E> },
    RolledBack(Reconciliation<E, D>),
}

impl<E: Entity, D> MutationOutcome<E, D> {
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }

    #[must_use]
    pub fn reconciliation(&self) -> Option<&Reconciliation<E, D>> {
        match self {
            Self::RolledBack(r) => Some(r),
            Self::Committed { .. } => None,
        }
    }
}

struct CollectionState<E: Entity> {
    cache: CollectionCache<E>,
    cursor: PaginationCursor,
}

/// The part of a coordinator that outlives a caller's mutation future.
struct Shared<E: Entity> {
    state: Mutex<CollectionState<E>>,
    published: watch::Sender<Arc<[E]>>,
}

impl<E: Entity> Shared<E> {
    fn lock_state(&self) -> MutexGuard<'_, CollectionState<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &CollectionState<E>) {
        self.published.send_replace(Arc::from(state.cache.items()));
    }
}

/// Owns one remote collection: its cache, its pagination cursor and the
/// per-key mutation locks.
///
/// All cache and cursor updates happen under a single mutex that is never
/// held across a remote call. Every completed update publishes a whole-list
/// snapshot to [`Self::subscribe`] receivers, so observers never see a
/// partial merge or a half-applied rollback.
///
/// Once a mutation's remote call has been issued it runs to completion on its
/// own task: dropping the future returned by `apply` (or its variants) only
/// stops the caller from hearing the outcome. The key stays locked, and pages
/// merged in the meantime leave it untouched, until the outcome is recorded.
pub struct SyncCoordinator<E: Entity, S> {
    name: String,
    source: S,
    shared: Arc<Shared<E>>,
    locks: MutationLocks<E::Key>,
}

impl<E, S> SyncCoordinator<E, S>
where
    E: Entity,
    S: RemoteCollectionSource<E>,
{
    pub fn new(name: impl Into<String>, source: S) -> Self {
        let (published, _) = watch::channel(Arc::from(Vec::new()));
        Self {
            name: name.into(),
            source,
            shared: Arc::new(Shared {
                state: Mutex::new(CollectionState {
                    cache: CollectionCache::new(),
                    cursor: PaginationCursor::new(),
                }),
                published,
            }),
            locks: MutationLocks::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fetch and merge the page after the current cursor position.
    ///
    /// Returns `AlreadyFetching` or `Exhausted` without touching the network
    /// when the cursor is gated. On failure the cursor and cache are left as
    /// they were, so calling again retries the same page. Items whose key has
    /// a mutation in flight are not merged.
    #[instrument(skip(self), fields(collection = %self.name))]
    pub async fn fetch_next_page(&self) -> Result<FetchStatus, SyncError> {
        let begun = self.shared.lock_state().cursor.begin();
        let ticket = match begun {
            Ok(ticket) => ticket,
            Err(status) => {
                debug!(?status, "page fetch skipped");
                return Ok(status);
            }
        };

        counter!("sync.page_fetch.requests").increment(1);
        let start = Instant::now();
        let guard = FetchGuard {
            state: &self.shared.state,
            ticket: Some(ticket.clone()),
        };

        let result = self.source.fetch_page(ticket.token()).await;

        guard.disarm();
        histogram!("sync.page_fetch.duration_ms").record(start.elapsed().as_secs_f64() * 1000.0);

        let mut state = self.shared.lock_state();
        match result {
            Ok(page) => {
                let exhausted = page.signals_end();
                if !state.cursor.complete(&ticket, page.next_token, exhausted) {
                    counter!("sync.page_fetch.discarded").increment(1);
                    warn!("collection was reset while fetching, page discarded");
                    return Ok(FetchStatus::Discarded);
                }
                let received = page.items.len();
                let stats = state
                    .cache
                    .merge_unless(page.items, |key| self.locks.is_held(key));
                self.shared.publish(&state);

                info!(
                    received,
                    inserted = stats.inserted,
                    replaced = stats.replaced,
                    held = stats.skipped,
                    exhausted,
                    total = state.cache.len(),
                    "page merged"
                );
                Ok(FetchStatus::Fetched {
                    received,
                    exhausted,
                })
            }
            Err(e) => {
                if !state.cursor.fail(&ticket) {
                    warn!(error = %e, "stale page fetch failed after reset");
                    return Ok(FetchStatus::Discarded);
                }
                counter!("sync.page_fetch.failures").increment(1);
                error!(error = %e, retryable = e.is_retryable(), "page fetch failed");
                Err(SyncError::Remote(e))
            }
        }
    }

    /// Clear the cache and rewind the cursor. A fetch still in flight will
    /// have its result discarded.
    #[instrument(skip(self), fields(collection = %self.name))]
    pub fn reset(&self) {
        let mut state = self.shared.lock_state();
        state.cursor.reset();
        state.cache.clear();
        self.shared.publish(&state);
        info!(generation = state.cursor.generation(), "collection reset");
    }

    /// Full reload: `reset` followed by a fetch of the first page.
    pub async fn refresh(&self) -> Result<FetchStatus, SyncError> {
        self.reset();
        self.fetch_next_page().await
    }

    /// Apply `transform` to the cached entity locally, then confirm it
    /// remotely. On failure the entity is restored to its exact prior value.
    ///
    /// Rejected with `MutationInProgress` if another mutation on `key` has
    /// not resolved yet, and with `NotFound` if `key` is not cached.
    #[instrument(skip(self, transform, mutation, descriptor), fields(collection = %self.name, key = %key))]
    pub async fn apply<M, F>(
        &self,
        key: &E::Key,
        transform: F,
        mutation: M,
        descriptor: M::Descriptor,
    ) -> Result<MutationOutcome<E, M::Descriptor>, SyncError>
    where
        M: RemoteMutation<E> + 'static,
        M::Descriptor: 'static,
        F: FnOnce(&E) -> E + Send,
    {
        let lease = self.locks.try_acquire(key).ok_or_else(|| self.reject_busy(key))?;

        let (snapshot, generation) = {
            let mut state = self.shared.lock_state();
            let prior = state.cache.mutate(key, transform).map_err(|e| {
                warn!("mutation target not cached");
                e
            })?;
            self.shared.publish(&state);
            (prior, state.cursor.generation())
        };
        debug!("optimistic update applied");
        counter!("sync.mutation.requests", "kind" => "update").increment(1);

        let key = key.clone();
        self.confirm(lease, mutation, descriptor, move |shared, state, result, descriptor| {
            match result {
                Ok(server_copy) => {
                    if let Some(copy) = server_copy {
                        if copy.key() != key {
                            warn!(returned = %copy.key(), "server copy has a different key, ignored");
                        } else if state.cache.replace(copy) {
                            shared.publish(state);
                        }
                    }
                    counter!("sync.mutation.committed").increment(1);
                    info!("mutation committed");
                    MutationOutcome::Committed {
                        entity: state.cache.get(&key).cloned(),
                        key,
                    }
                }
                Err(error) => {
                    let restored = state.cursor.generation() == generation
                        && state.cache.restore(&key, snapshot.clone());
                    if restored {
                        shared.publish(state);
                    }
                    log_rollback(&error, restored);
                    MutationOutcome::RolledBack(Reconciliation {
                        key,
                        kind: MutationKind::Update,
                        attempted: descriptor,
                        snapshot: Some(snapshot),
                        restored,
                        error,
                    })
                }
            }
        })
        .await
    }

    /// Remove the entity locally, then delete it remotely. On failure it is
    /// put back at the index it occupied when the call started.
    #[instrument(skip(self, mutation, descriptor), fields(collection = %self.name, key = %key))]
    pub async fn apply_delete<M>(
        &self,
        key: &E::Key,
        mutation: M,
        descriptor: M::Descriptor,
    ) -> Result<MutationOutcome<E, M::Descriptor>, SyncError>
    where
        M: RemoteMutation<E> + 'static,
        M::Descriptor: 'static,
    {
        let lease = self.locks.try_acquire(key).ok_or_else(|| self.reject_busy(key))?;

        let (index, removed, generation) = {
            let mut state = self.shared.lock_state();
            let (index, removed) = state.cache.remove_indexed(key).map_err(|e| {
                warn!("delete target not cached");
                e
            })?;
            self.shared.publish(&state);
            (index, removed, state.cursor.generation())
        };
        debug!(index, "optimistic delete applied");
        counter!("sync.mutation.requests", "kind" => "delete").increment(1);

        let key = key.clone();
        self.confirm(lease, mutation, descriptor, move |shared, state, result, descriptor| {
            match result {
                Ok(_) => {
                    counter!("sync.mutation.committed").increment(1);
                    info!("delete committed");
                    MutationOutcome::Committed { key, entity: None }
                }
                Err(error) => {
                    let restored = state.cursor.generation() == generation;
                    if restored {
                        state.cache.insert_at(index, removed.clone());
                        shared.publish(state);
                    }
                    log_rollback(&error, restored);
                    MutationOutcome::RolledBack(Reconciliation {
                        key,
                        kind: MutationKind::Delete,
                        attempted: descriptor,
                        snapshot: Some(removed),
                        restored,
                        error,
                    })
                }
            }
        })
        .await
    }

    /// Append `entity` locally, then create it remotely. A server copy
    /// replaces the local placeholder in place, even if the server assigned a
    /// different key. On failure the placeholder is removed.
    #[instrument(skip(self, entity, mutation, descriptor), fields(collection = %self.name, key = %entity.key()))]
    pub async fn apply_insert<M>(
        &self,
        entity: E,
        mutation: M,
        descriptor: M::Descriptor,
    ) -> Result<MutationOutcome<E, M::Descriptor>, SyncError>
    where
        M: RemoteMutation<E> + 'static,
        M::Descriptor: 'static,
    {
        let key = entity.key();
        let lease = self.locks.try_acquire(&key).ok_or_else(|| self.reject_busy(&key))?;

        let generation = {
            let mut state = self.shared.lock_state();
            state.cache.push(entity)?;
            self.shared.publish(&state);
            state.cursor.generation()
        };
        counter!("sync.mutation.requests", "kind" => "insert").increment(1);

        self.confirm(lease, mutation, descriptor, move |shared, state, result, descriptor| {
            let stale = state.cursor.generation() != generation;
            match result {
                Ok(server_copy) => {
                    let mut final_key = key.clone();
                    if let Some(copy) = server_copy {
                        final_key = copy.key();
                        if !stale && state.cache.rekey(&key, copy).is_ok() {
                            shared.publish(state);
                        }
                    }
                    counter!("sync.mutation.committed").increment(1);
                    info!(committed_key = %final_key, "insert committed");
                    MutationOutcome::Committed {
                        entity: state.cache.get(&final_key).cloned(),
                        key: final_key,
                    }
                }
                Err(error) => {
                    let restored = !stale && state.cache.remove(&key).is_ok();
                    if restored {
                        shared.publish(state);
                    }
                    log_rollback(&error, restored);
                    MutationOutcome::RolledBack(Reconciliation {
                        key,
                        kind: MutationKind::Insert,
                        attempted: descriptor,
                        snapshot: None,
                        restored,
                        error,
                    })
                }
            }
        })
        .await
    }

    /// The current collection, in display order.
    #[must_use]
    pub fn snapshot(&self) -> Arc<[E]> {
        self.shared.published.borrow().clone()
    }

    #[must_use]
    pub fn get(&self, key: &E::Key) -> Option<E> {
        self.shared.lock_state().cache.get(key).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock_state().cache.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn any<P>(&self, predicate: P) -> bool
    where
        P: FnMut(&E) -> bool,
    {
        self.shared.lock_state().cache.any(predicate)
    }

    #[must_use]
    pub fn cursor(&self) -> PaginationCursor {
        self.shared.lock_state().cursor.clone()
    }

    #[must_use]
    pub fn is_mutating(&self, key: &E::Key) -> bool {
        self.locks.is_held(key)
    }

    /// Receive a fresh snapshot after every merge, optimistic change, commit,
    /// rollback and reset.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<[E]>> {
        self.shared.published.subscribe()
    }

    /// Run the remote call and `resolve` its result against the collection on
    /// a task of its own, releasing `lease` afterwards. Without a runtime
    /// handle the work runs inline.
    async fn confirm<M, R>(
        &self,
        lease: KeyLease<E::Key>,
        mutation: M,
        descriptor: M::Descriptor,
        resolve: R,
    ) -> Result<MutationOutcome<E, M::Descriptor>, SyncError>
    where
        M: RemoteMutation<E> + 'static,
        M::Descriptor: 'static,
        R: FnOnce(
                &Shared<E>,
                &mut CollectionState<E>,
                Result<Option<E>, RemoteError>,
                M::Descriptor,
            ) -> MutationOutcome<E, M::Descriptor>
            + Send
            + 'static,
    {
        let key = lease.key().to_string();
        let shared = Arc::clone(&self.shared);
        let settle = async move {
            let result = mutation.execute(&descriptor).await;
            let mut state = shared.lock_state();
            let outcome = resolve(&shared, &mut *state, result, descriptor);
            drop(state);
            drop(lease);
            outcome
        }
        .in_current_span();

        match Handle::try_current() {
            Ok(handle) => handle.spawn(settle).await.map_err(|e| {
                counter!("sync.mutation.interrupted").increment(1);
                error!(error = %e, "mutation task did not complete");
                SyncError::Interrupted {
                    key,
                    reason: e.to_string(),
                }
            }),
            Err(_) => Ok(settle.await),
        }
    }

    fn reject_busy(&self, key: &E::Key) -> SyncError {
        counter!("sync.mutation.rejected").increment(1);
        warn!(collection = %self.name, key = %key, "mutation already in flight");
        SyncError::MutationInProgress {
            key: key.to_string(),
        }
    }
}

fn log_rollback(error: &RemoteError, restored: bool) {
    counter!("sync.mutation.rolled_back").increment(1);
    if restored {
        warn!(error = %error, class = %error.class, "mutation rolled back");
    } else {
        warn!(error = %error, class = %error.class, "mutation failed, rollback target gone");
    }
}

/// Releases the `Fetching` state if a page fetch future is dropped before the
/// source answers.
struct FetchGuard<'a, E: Entity> {
    state: &'a Mutex<CollectionState<E>>,
    ticket: Option<FetchTicket>,
}

impl<E: Entity> FetchGuard<'_, E> {
    fn disarm(mut self) {
        self.ticket = None;
    }
}

impl<E: Entity> Drop for FetchGuard<'_, E> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.cursor.fail(&ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::Item;
    use crate::cursor::{Page, PageToken};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedSource {
        pages: Mutex<VecDeque<Result<Page<Item>, RemoteError>>>,
        seen_tokens: Mutex<Vec<Option<PageToken>>>,
    }

    impl ScriptedSource {
        fn with(pages: Vec<Result<Page<Item>, RemoteError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                seen_tokens: Mutex::default(),
            }
        }
    }

    #[async_trait::async_trait]
    impl RemoteCollectionSource<Item> for ScriptedSource {
        async fn fetch_page(&self, token: Option<&PageToken>) -> Result<Page<Item>, RemoteError> {
            self.seen_tokens.lock().unwrap().push(token.cloned());
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Page::last(vec![])))
        }
    }

    #[derive(Default)]
    struct FailableMutation {
        should_fail: AtomicBool,
        calls: AtomicUsize,
        server_value: Mutex<Option<Item>>,
    }

    impl FailableMutation {
        fn set_fail(&self, fail: bool) {
            self.should_fail.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl RemoteMutation<Item> for FailableMutation {
        type Descriptor = &'static str;

        async fn execute(&self, _descriptor: &&'static str) -> Result<Option<Item>, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.should_fail.load(Ordering::SeqCst) {
                return Err(RemoteError::permanent("rejected").with_status(422));
            }
            Ok(self.server_value.lock().unwrap().clone())
        }
    }

    fn page(ids: std::ops::Range<u32>) -> Vec<Item> {
        ids.map(|id| Item::new(id, "v0")).collect()
    }

    async fn loaded(ids: std::ops::Range<u32>) -> SyncCoordinator<Item, ScriptedSource> {
        let coordinator =
            SyncCoordinator::new("items", ScriptedSource::with(vec![Ok(Page::last(page(ids)))]));
        coordinator.fetch_next_page().await.unwrap();
        coordinator
    }

    #[tokio::test]
    async fn test_fetch_merges_and_advances() {
        let source = ScriptedSource::with(vec![
            Ok(Page::more(page(0..3), PageToken::new("2"))),
            Ok(Page::last(page(3..5))),
        ]);
        let coordinator = SyncCoordinator::new("items", source);

        let first = coordinator.fetch_next_page().await.unwrap();
        assert_eq!(
            first,
            FetchStatus::Fetched {
                received: 3,
                exhausted: false
            }
        );
        assert_eq!(coordinator.cursor().next_token(), Some(&PageToken::new("2")));

        let second = coordinator.fetch_next_page().await.unwrap();
        assert_eq!(
            second,
            FetchStatus::Fetched {
                received: 2,
                exhausted: true
            }
        );
        assert_eq!(coordinator.fetch_next_page().await.unwrap(), FetchStatus::Exhausted);

        let ids: Vec<u32> = coordinator.snapshot().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(
            *coordinator.source().seen_tokens.lock().unwrap(),
            vec![None, Some(PageToken::new("2"))]
        );
    }

    #[tokio::test]
    async fn test_failed_fetch_retries_same_token() {
        let source = ScriptedSource::with(vec![
            Ok(Page::more(page(0..2), PageToken::new("2"))),
            Err(RemoteError::transient("timeout")),
            Ok(Page::last(page(2..4))),
        ]);
        let coordinator = SyncCoordinator::new("items", source);
        coordinator.fetch_next_page().await.unwrap();

        let err = coordinator.fetch_next_page().await.unwrap_err();
        assert!(err.is_retryable());
        let cursor = coordinator.cursor();
        assert_eq!(cursor.next_token(), Some(&PageToken::new("2")));
        assert!(!cursor.is_exhausted());
        assert_eq!(coordinator.len(), 2);

        coordinator.fetch_next_page().await.unwrap();
        assert_eq!(coordinator.len(), 4);
        let tokens = coordinator.source().seen_tokens.lock().unwrap().clone();
        assert_eq!(tokens[1], tokens[2]);
    }

    #[tokio::test]
    async fn test_refresh_replaces_contents() {
        let source = ScriptedSource::with(vec![
            Ok(Page::last(page(0..3))),
            Ok(Page::last(vec![Item::new(7, "fresh")])),
        ]);
        let coordinator = SyncCoordinator::new("items", source);
        coordinator.fetch_next_page().await.unwrap();

        coordinator.refresh().await.unwrap();

        let items = coordinator.snapshot();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0], Item::new(7, "fresh"));
    }

    #[tokio::test]
    async fn test_apply_commits_and_merges_server_copy() {
        let coordinator = loaded(0..3).await;
        let mutation = Arc::new(FailableMutation::default());
        *mutation.server_value.lock().unwrap() = Some(Item::new(1, "server"));

        let outcome = coordinator
            .apply(&1, |i| Item::new(i.id, "local"), Arc::clone(&mutation), "rename")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            MutationOutcome::Committed {
                key: 1,
                entity: Some(Item::new(1, "server"))
            }
        );
        assert!(!coordinator.is_mutating(&1));
    }

    #[tokio::test]
    async fn test_apply_rolls_back_on_failure() {
        let coordinator = loaded(0..3).await;
        let mutation = Arc::new(FailableMutation::default());
        mutation.set_fail(true);

        let outcome = coordinator
            .apply(&1, |i| Item::new(i.id, "local"), Arc::clone(&mutation), "rename")
            .await
            .unwrap();

        let reconciliation = outcome.reconciliation().unwrap();
        assert_eq!(reconciliation.attempted, "rename");
        assert_eq!(reconciliation.kind, MutationKind::Update);
        assert!(reconciliation.restored);
        assert_eq!(reconciliation.error.status, Some(422));
        assert_eq!(coordinator.get(&1), Some(Item::new(1, "v0")));
    }

    #[tokio::test]
    async fn test_apply_missing_key_is_rejected_without_remote_call() {
        let coordinator = loaded(0..2).await;
        let mutation = Arc::new(FailableMutation::default());

        let err = coordinator
            .apply(&9, Clone::clone, Arc::clone(&mutation), "noop")
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::NotFound { .. }));
        assert_eq!(mutation.calls.load(Ordering::SeqCst), 0);
        assert!(!coordinator.is_mutating(&9));
    }

    #[tokio::test]
    async fn test_delete_rollback_restores_index() {
        let coordinator = loaded(0..5).await;
        let mutation = Arc::new(FailableMutation::default());
        mutation.set_fail(true);

        let outcome = coordinator
            .apply_delete(&2, Arc::clone(&mutation), "delete")
            .await
            .unwrap();

        assert!(!outcome.is_committed());
        let ids: Vec<u32> = coordinator.snapshot().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_insert_rekeys_to_server_copy() {
        let coordinator = loaded(0..2).await;
        let mutation = Arc::new(FailableMutation::default());
        *mutation.server_value.lock().unwrap() = Some(Item::new(100, "server"));

        let outcome = coordinator
            .apply_insert(Item::new(50, "draft"), Arc::clone(&mutation), "create")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            MutationOutcome::Committed {
                key: 100,
                entity: Some(Item::new(100, "server"))
            }
        );
        let ids: Vec<u32> = coordinator.snapshot().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![0, 1, 100]);
    }

    #[tokio::test]
    async fn test_insert_failure_removes_placeholder() {
        let coordinator = loaded(0..2).await;
        let mutation = Arc::new(FailableMutation::default());
        mutation.set_fail(true);

        let outcome = coordinator
            .apply_insert(Item::new(50, "draft"), Arc::clone(&mutation), "create")
            .await
            .unwrap();

        let reconciliation = outcome.reconciliation().unwrap();
        assert_eq!(reconciliation.kind, MutationKind::Insert);
        assert!(reconciliation.snapshot.is_none());
        assert_eq!(coordinator.len(), 2);
    }

    #[tokio::test]
    async fn test_insert_existing_key_rejected() {
        let coordinator = loaded(0..2).await;
        let mutation = Arc::new(FailableMutation::default());

        let err = coordinator
            .apply_insert(Item::new(1, "dup"), Arc::clone(&mutation), "create")
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::AlreadyExists { .. }));
        assert_eq!(mutation.calls.load(Ordering::SeqCst), 0);
    }

    struct PanickingMutation;

    #[async_trait::async_trait]
    impl RemoteMutation<Item> for PanickingMutation {
        type Descriptor = &'static str;

        async fn execute(&self, descriptor: &&'static str) -> Result<Option<Item>, RemoteError> {
            panic!("remote handler crashed on {descriptor}");
        }
    }

    #[tokio::test]
    async fn test_panicking_remote_call_reports_interrupted_and_frees_key() {
        let coordinator = loaded(0..2).await;

        let err = coordinator
            .apply(&1, |i| Item::new(i.id, "local"), PanickingMutation, "rename")
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Interrupted { ref key, .. } if key == "1"));
        assert!(!err.is_retryable());
        assert!(!coordinator.is_mutating(&1));
    }

    #[tokio::test]
    async fn test_subscribers_see_optimistic_and_final_states() {
        let coordinator = loaded(0..1).await;
        let mut rx = coordinator.subscribe();
        rx.borrow_and_update();
        let mutation = Arc::new(FailableMutation::default());
        mutation.set_fail(true);

        coordinator
            .apply(&0, |i| Item::new(i.id, "local"), Arc::clone(&mutation), "rename")
            .await
            .unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update()[0], Item::new(0, "v0"));
    }
}
