//! Completable events and the reaper that expires or cancels them.
//!
//! A [`Completable<T>`] is a single-use result slot: it resolves exactly
//! once, either because the owning component calls [`Completable::resolve`]
//! / [`Completable::fail`], or because its deadline elapsed and
//! [`Reaper::reap`] resolved it with a timeout, or because the reactor shut
//! down and [`Reaper::reap_all`] cancelled it. Both paths share one
//! take-once slot, so whichever resolves first wins and the other is a
//! silent no-op, guaranteeing every completable resolves exactly once
//! without any extra bookkeeping at call sites.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use kcgroup_types::GroupError;
use tokio::sync::oneshot;

type ResultSlot<T> = Rc<RefCell<Option<oneshot::Sender<Result<T, GroupError>>>>>;

/// The reactor-side handle to a completable event: resolve it exactly once.
pub struct Completable<T> {
    id: u64,
    slot: ResultSlot<T>,
    reaper: Rc<RefCell<Reaper>>,
}

impl<T> Completable<T> {
    pub fn resolve(self, value: T) {
        self.finish(Ok(value));
    }

    pub fn fail(self, err: GroupError) {
        self.finish(Err(err));
    }

    fn finish(self, result: Result<T, GroupError>) {
        if let Some(tx) = self.slot.borrow_mut().take() {
            let _ = tx.send(result);
        }
        self.reaper.borrow_mut().cancel(self.id);
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// The caller-side half: a plain, `Send` future over the eventual result.
pub struct CompletableFuture<T>(oneshot::Receiver<Result<T, GroupError>>);

impl<T> CompletableFuture<T> {
    pub async fn wait(self) -> Result<T, GroupError> {
        self.0.await.unwrap_or(Err(GroupError::Cancelled))
    }

    /// Non-blocking check used by managers inside their synchronous `poll`:
    /// `Ok(None)` means still pending, anything else is terminal.
    pub fn try_take(&mut self) -> Option<Result<T, GroupError>> {
        match self.0.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(GroupError::Cancelled)),
        }
    }
}

struct ReaperEntry {
    deadline_ms: i64,
    resolver: Box<dyn FnOnce(GroupError)>,
}

/// Tracks every outstanding [`Completable`] by absolute deadline and expires
/// or cancels them on demand. Idempotent: resolving an entry through its
/// `Completable` handle removes it here too, so a later `reap` is a no-op.
#[derive(Default)]
pub struct Reaper {
    entries: HashMap<u64, ReaperEntry>,
    next_id: u64,
}

impl Reaper {
    #[must_use]
    pub fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::default()))
    }

    /// Registers a new completable event with an absolute deadline and
    /// returns both halves.
    pub fn track<T: 'static>(
        reaper: &Rc<RefCell<Reaper>>,
        deadline_ms: i64,
    ) -> (Completable<T>, CompletableFuture<T>) {
        let (tx, rx) = oneshot::channel();
        let slot: ResultSlot<T> = Rc::new(RefCell::new(Some(tx)));

        let id = {
            let mut this = reaper.borrow_mut();
            let id = this.next_id;
            this.next_id += 1;
            let resolver_slot = Rc::clone(&slot);
            this.entries.insert(
                id,
                ReaperEntry {
                    deadline_ms,
                    resolver: Box::new(move |err| {
                        if let Some(tx) = resolver_slot.borrow_mut().take() {
                            let _ = tx.send(Err(err));
                        }
                    }),
                },
            );
            id
        };

        let completable = Completable {
            id,
            slot,
            reaper: Rc::clone(reaper),
        };
        (completable, CompletableFuture(rx))
    }

    /// Like [`Reaper::track`] but adopts an existing sender instead of
    /// minting a fresh channel — used for application events, whose reply
    /// channel is created on the enqueuing thread before the event ever
    /// reaches the reactor.
    pub fn adopt<T: 'static>(
        reaper: &Rc<RefCell<Reaper>>,
        deadline_ms: i64,
        tx: oneshot::Sender<Result<T, GroupError>>,
    ) -> Completable<T> {
        let slot: ResultSlot<T> = Rc::new(RefCell::new(Some(tx)));
        let mut this = reaper.borrow_mut();
        let id = this.next_id;
        this.next_id += 1;
        let resolver_slot = Rc::clone(&slot);
        this.entries.insert(
            id,
            ReaperEntry {
                deadline_ms,
                resolver: Box::new(move |err| {
                    if let Some(tx) = resolver_slot.borrow_mut().take() {
                        let _ = tx.send(Err(err));
                    }
                }),
            },
        );
        drop(this);
        Completable {
            id,
            slot,
            reaper: Rc::clone(reaper),
        }
    }

    /// Drops bookkeeping for an event that resolved through its own
    /// `Completable` handle. Safe to call for an id that no longer exists.
    fn cancel(&mut self, id: u64) {
        self.entries.remove(&id);
    }

    /// Expires every entry whose deadline has passed, resolving each with a
    /// timeout error. Entries not yet due are left tracked.
    pub fn reap(&mut self, now_ms: i64) {
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline_ms <= now_ms)
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            if let Some(entry) = self.entries.remove(&id) {
                (entry.resolver)(GroupError::Timeout);
            }
        }
    }

    /// Cancels every tracked entry unconditionally. Used on reactor
    /// shutdown's final drain.
    pub fn reap_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            (entry.resolver)(GroupError::Cancelled);
        }
    }

    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }
}

/// Builds an already-resolved future, for operations that are no-ops given
/// current state (e.g. leaving a group that's already `UNSUBSCRIBED`, or
/// auto-committing with no positions tracked).
#[must_use]
pub fn resolved<T: 'static>(reaper: &Rc<RefCell<Reaper>>, value: T) -> CompletableFuture<T> {
    let (completable, future) = Reaper::track::<T>(reaper, i64::MAX);
    completable.resolve(value);
    future
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_exactly_once_even_if_reaped_after() {
        let reaper = Reaper::new();
        let (completable, future) = Reaper::track::<i32>(&reaper, 1_000);
        completable.resolve(42);
        assert_eq!(reaper.borrow().tracked_count(), 0);
        reaper.borrow_mut().reap(2_000);
        assert_eq!(future.wait().await, Ok(42));
    }

    #[tokio::test]
    async fn reap_resolves_expired_with_timeout() {
        let reaper = Reaper::new();
        let (_completable, future) = Reaper::track::<i32>(&reaper, 100);
        reaper.borrow_mut().reap(50);
        assert_eq!(reaper.borrow().tracked_count(), 1);
        reaper.borrow_mut().reap(100);
        assert_eq!(reaper.borrow().tracked_count(), 0);
        assert_eq!(future.wait().await, Err(GroupError::Timeout));
    }

    #[tokio::test]
    async fn reap_all_cancels_everything_regardless_of_deadline() {
        let reaper = Reaper::new();
        let (_c1, f1) = Reaper::track::<i32>(&reaper, i64::MAX);
        let (_c2, f2) = Reaper::track::<i32>(&reaper, i64::MAX);
        reaper.borrow_mut().reap_all();
        assert_eq!(f1.wait().await, Err(GroupError::Cancelled));
        assert_eq!(f2.wait().await, Err(GroupError::Cancelled));
        assert_eq!(reaper.borrow().tracked_count(), 0);
    }

    #[tokio::test]
    async fn double_resolve_is_a_silent_no_op() {
        let reaper = Reaper::new();
        let (completable, future) = Reaper::track::<i32>(&reaper, 100);
        completable.resolve(1);
        // A concurrent `reap` over the same deadline must not re-resolve.
        reaper.borrow_mut().reap(1_000);
        assert_eq!(future.wait().await, Ok(1));
    }
}
