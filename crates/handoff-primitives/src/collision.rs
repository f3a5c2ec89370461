//! Thread collision detection for objects that are not thread-safe.
//!
//! A [`ThreadCollisionWarner`] is embedded in an object whose methods must not
//! run on two threads at once. Each guarded entry point opens a scope; if a
//! second thread opens one while the first is still inside, the warner's
//! [`CollisionAsserter`] fires. It never blocks and never stops the second
//! thread. It is a diagnostic, not a lock.
//!
//! ```
//! use handoff_primitives::collision::ThreadCollisionWarner;
//!
//! struct Queue {
//!     items: Vec<u32>,
//!     warner: ThreadCollisionWarner,
//! }
//!
//! impl Queue {
//!     fn push(&mut self, item: u32) {
//!         let _scope = self.warner.scoped_recursive();
//!         self.items.push(item);
//!     }
//! }
//! ```
//!
//! Only atomics are used, so the warner is usable inside hot paths and inside
//! code that implements locks itself.

use core::sync::atomic::AtomicU64 as IdCounter;

use crate::sync::{AtomicU32, AtomicU64, AtomicUsize, Ordering, thread_local};

/// Reserved id meaning "no thread inside".
const UNCLAIMED: u64 = 0;

static NEXT_THREAD_ID: IdCounter = IdCounter::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
}

/// A nonzero id for the calling thread, stable for the thread's lifetime.
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// Reaction to a detected collision.
pub trait CollisionAsserter {
    fn warn(&self);
}

/// Panics on collision.
#[derive(Debug, Default, Clone, Copy)]
pub struct PanicAsserter;

impl CollisionAsserter for PanicAsserter {
    fn warn(&self) {
        panic!("thread collision: guarded region entered while another thread is inside");
    }
}

/// Logs collisions at error level and carries on.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAsserter;

impl CollisionAsserter for LogAsserter {
    fn warn(&self) {
        tracing::error!(
            thread_id = current_thread_id(),
            "thread collision: guarded region entered while another thread is inside"
        );
    }
}

/// Counts collisions. Meant for tests that provoke them on purpose.
pub struct CountingAsserter {
    count: AtomicUsize,
}

impl CountingAsserter {
    pub fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Default for CountingAsserter {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for CountingAsserter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CountingAsserter")
            .field("count", &self.count())
            .finish()
    }
}

impl CollisionAsserter for CountingAsserter {
    fn warn(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

impl<A: CollisionAsserter + ?Sized> CollisionAsserter for &A {
    fn warn(&self) {
        (**self).warn();
    }
}

impl<A: CollisionAsserter + ?Sized> CollisionAsserter for std::sync::Arc<A> {
    fn warn(&self) {
        (**self).warn();
    }
}

/// Fatal in debug builds, logged in release builds.
#[cfg(debug_assertions)]
pub type DefaultAsserter = PanicAsserter;
#[cfg(not(debug_assertions))]
pub type DefaultAsserter = LogAsserter;

/// Detects concurrent entry into a region that must be single-threaded.
pub struct ThreadCollisionWarner<A: CollisionAsserter = DefaultAsserter> {
    valid_thread_id: AtomicU64,
    counter: AtomicU32,
    asserter: A,
}

impl Default for ThreadCollisionWarner<DefaultAsserter> {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadCollisionWarner<DefaultAsserter> {
    pub fn new() -> Self {
        Self::with_asserter(DefaultAsserter::default())
    }
}

impl<A: CollisionAsserter> ThreadCollisionWarner<A> {
    pub fn with_asserter(asserter: A) -> Self {
        Self {
            valid_thread_id: AtomicU64::new(UNCLAIMED),
            counter: AtomicU32::new(0),
            asserter,
        }
    }

    pub fn asserter(&self) -> &A {
        &self.asserter
    }

    /// Claim the region for the calling thread, warning if another thread
    /// holds it. The same thread re-claiming is not a collision.
    #[inline]
    fn claim(&self) {
        let current = current_thread_id();
        match self.valid_thread_id.compare_exchange(
            UNCLAIMED,
            current,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(previous) if previous == current => {}
            Err(_) => self.asserter.warn(),
        }
    }

    /// Enter the guarded region.
    ///
    /// Warns if another thread is inside. Nested entry from the thread that
    /// is already inside is allowed and tracked by the reentrancy counter.
    pub fn enter(&self) {
        self.claim();
        self.counter.fetch_add(1, Ordering::AcqRel);
    }

    /// Enter the guarded region on behalf of the object's own thread.
    ///
    /// The first entrant establishes the expected thread for as long as the
    /// outermost scope stays open; any other thread entering meanwhile is a
    /// collision.
    pub fn enter_self(&self) {
        self.claim();
        self.counter.fetch_add(1, Ordering::AcqRel);
    }

    /// Leave the guarded region. The outermost leave releases the claim.
    pub fn leave(&self) {
        let previous = self.counter.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "leave without matching enter");
        if previous == 1 {
            self.valid_thread_id.store(UNCLAIMED, Ordering::Release);
        }
    }

    /// Pin the object to the first thread that calls this, for the rest of
    /// the warner's life. Later calls from any other thread warn.
    ///
    /// Nothing is released afterwards, so do not mix with scoped entry on the
    /// same warner.
    pub fn check(&self) {
        self.claim();
    }

    /// Enter for the lifetime of the returned guard.
    pub fn scoped(&self) -> ScopedCheck<'_, A> {
        self.enter();
        ScopedCheck { warner: self }
    }

    /// Enter via [`enter_self`](Self::enter_self) for the lifetime of the
    /// returned guard.
    pub fn scoped_recursive(&self) -> ScopedRecursiveCheck<'_, A> {
        self.enter_self();
        ScopedRecursiveCheck { warner: self }
    }

    /// Current nesting depth.
    pub fn depth(&self) -> u32 {
        self.counter.load(Ordering::Acquire)
    }

    /// True while some thread holds the region.
    pub fn is_claimed(&self) -> bool {
        self.valid_thread_id.load(Ordering::Acquire) != UNCLAIMED
    }
}

impl<A: CollisionAsserter> core::fmt::Debug for ThreadCollisionWarner<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadCollisionWarner")
            .field("valid_thread_id", &self.valid_thread_id.load(Ordering::Relaxed))
            .field("depth", &self.counter.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Guard returned by [`ThreadCollisionWarner::scoped`].
#[must_use = "the region is left as soon as the guard is dropped"]
pub struct ScopedCheck<'a, A: CollisionAsserter> {
    warner: &'a ThreadCollisionWarner<A>,
}

impl<A: CollisionAsserter> Drop for ScopedCheck<'_, A> {
    fn drop(&mut self) {
        self.warner.leave();
    }
}

/// Guard returned by [`ThreadCollisionWarner::scoped_recursive`].
#[must_use = "the region is left as soon as the guard is dropped"]
pub struct ScopedRecursiveCheck<'a, A: CollisionAsserter> {
    warner: &'a ThreadCollisionWarner<A>,
}

impl<A: CollisionAsserter> Drop for ScopedRecursiveCheck<'_, A> {
    fn drop(&mut self) {
        self.warner.leave();
    }
}
