//! The Batch Query Manager (BQM): coalesces point lookups issued by
//! the Ingest Coordinator's many in-flight per-file tasks into periodic
//! batched catalog queries.
//!
//! There's no Rust analog for this in the retrieved corpus; the shape
//! (two sub-batchers, a distinct-keys set, flush-on-count/time/idle) is
//! grounded on the original Python implementation's `BatchFetcherBase` and
//! its `BlobBySizeFetcher`/`BlobByHashFetcher` subclasses.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use anyhow::Result;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::catalog::CatalogSession;
use crate::catalog::model::Blob;
use crate::config::{BATCH_WINDOW, MAX_BATCH_SIZE};
use crate::hashing::Fingerprint;

/// Answers "does any blob of size `s` already exist?", backing the
/// `hash_once` eligibility check.
#[derive(Default)]
struct SizeBatcher {
    pending: Vec<(u64, Waker)>,
    distinct: FxHashSet<u64>,
    first_queued: Option<Instant>,
    cache: FxHashMap<u64, bool>,
}

impl SizeBatcher {
    fn enqueue(&mut self, size: u64, waker: Waker) {
        if self.pending.is_empty() {
            self.first_queued = Some(Instant::now());
        }
        self.distinct.insert(size);
        self.pending.push((size, waker));
    }

    fn should_flush(&self) -> bool {
        !self.pending.is_empty()
            && (self.pending.len() >= MAX_BATCH_SIZE
                || self
                    .first_queued
                    .is_some_and(|t| t.elapsed() >= BATCH_WINDOW))
    }

    fn flush(&mut self, cs: &CatalogSession) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let sizes: Vec<u64> = self.distinct.iter().copied().collect();
        let answers = cs.has_blob_with_size_batched(&sizes)?;
        self.cache.extend(answers);
        self.distinct.clear();
        self.first_queued = None;
        // Reverse enqueue order: each waker, once invoked, prepends
        // its task back onto the scheduler's ready deque, so waking in
        // reverse restores original file order at the front of that deque.
        for (_, waker) in std::mem::take(&mut self.pending).into_iter().rev() {
            waker.wake();
        }
        Ok(())
    }
}

/// Answers "fetch the Blob row for fingerprint `h`, if any", backing the
/// dedup short-circuit check.
#[derive(Default)]
struct HashBatcher {
    pending: Vec<(Fingerprint, Waker)>,
    distinct: FxHashSet<Fingerprint>,
    first_queued: Option<Instant>,
    cache: FxHashMap<Fingerprint, Option<Blob>>,
}

impl HashBatcher {
    fn enqueue(&mut self, hash: Fingerprint, waker: Waker) {
        if self.pending.is_empty() {
            self.first_queued = Some(Instant::now());
        }
        self.distinct.insert(hash);
        self.pending.push((hash, waker));
    }

    fn should_flush(&self) -> bool {
        !self.pending.is_empty()
            && (self.pending.len() >= MAX_BATCH_SIZE
                || self
                    .first_queued
                    .is_some_and(|t| t.elapsed() >= BATCH_WINDOW))
    }

    fn flush(&mut self, cs: &CatalogSession) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let hashes: Vec<Fingerprint> = self.distinct.iter().cloned().collect();
        let found = cs.get_blobs(&hashes)?;
        for h in &hashes {
            self.cache.insert(h.clone(), found.get(h).cloned());
        }
        self.distinct.clear();
        self.first_queued = None;
        for (_, waker) in std::mem::take(&mut self.pending).into_iter().rev() {
            waker.wake();
        }
        Ok(())
    }
}

/// The coordinator's single BQM instance, shared (via `Rc<RefCell<_>>`)
/// between the scheduler's main loop and every in-flight ingest task's
/// query futures.
#[derive(Default)]
pub struct Bqm {
    size: SizeBatcher,
    hash: HashBatcher,
}

impl Bqm {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_size(&self, size: u64) -> Option<bool> {
        self.size.cache.get(&size).copied()
    }

    fn check_hash(&self, hash: &Fingerprint) -> Option<Option<Blob>> {
        self.hash.cache.get(hash).cloned()
    }

    fn enqueue_size(&mut self, size: u64, waker: Waker) {
        self.size.enqueue(size, waker);
    }

    fn enqueue_hash(&mut self, hash: Fingerprint, waker: Waker) {
        self.hash.enqueue(hash, waker);
    }

    /// True if the deque-empty flush condition should fire regardless of
    /// count/time thresholds.
    pub fn is_idle(&self) -> bool {
        self.size.pending.is_empty() && self.hash.pending.is_empty()
    }

    /// `BQM.flush_if_needed()`: flush whichever sub-batcher has crossed its
    /// count or time threshold.
    pub fn flush_if_needed(&mut self, cs: &CatalogSession) -> Result<()> {
        if self.size.should_flush() {
            self.size.flush(cs)?;
            crate::counters::bump(crate::counters::Op::BqmBatchFlush);
        }
        if self.hash.should_flush() {
            self.hash.flush(cs)?;
            crate::counters::bump(crate::counters::Op::BqmBatchFlush);
        }
        Ok(())
    }

    /// `BQM.flush()`: unconditional flush of both sub-batchers, used to
    /// unblock pending callbacks when the coordinator's ready deque runs
    /// dry.
    pub fn flush(&mut self, cs: &CatalogSession) -> Result<()> {
        self.size.flush(cs)?;
        self.hash.flush(cs)?;
        Ok(())
    }

    /// Directly seeds `blob_by_size[raw_size] := true` after the Ingest
    /// Coordinator commits a freshly-written blob, so a later query in the
    /// same run never has to round-trip for a size this run already knows
    /// about.
    pub fn record_size_exists(&mut self, size: u64) {
        self.size.cache.insert(size, true);
    }

    /// Directly seeds `blob_by_hash[H] := row` after a commit.
    pub fn record_blob(&mut self, fingerprint: Fingerprint, blob: Blob) {
        self.hash.cache.insert(fingerprint, Some(blob));
    }
}

/// A suspended `query(size)` request. Resolves once the owning
/// [`Bqm`] has flushed a batch that covered this size.
pub struct SizeQuery {
    bqm: Rc<RefCell<Bqm>>,
    size: u64,
    registered: bool,
}

impl SizeQuery {
    pub fn new(bqm: Rc<RefCell<Bqm>>, size: u64) -> Self {
        Self {
            bqm,
            size,
            registered: false,
        }
    }
}

impl Future for SizeQuery {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        let this = self.get_mut();
        let mut bqm = this.bqm.borrow_mut();
        if let Some(answer) = bqm.check_size(this.size) {
            return Poll::Ready(answer);
        }
        if !this.registered {
            bqm.enqueue_size(this.size, cx.waker().clone());
            this.registered = true;
        }
        Poll::Pending
    }
}

/// A suspended `query(hash)` request.
pub struct HashQuery {
    bqm: Rc<RefCell<Bqm>>,
    hash: Fingerprint,
    registered: bool,
}

impl HashQuery {
    pub fn new(bqm: Rc<RefCell<Bqm>>, hash: Fingerprint) -> Self {
        Self {
            bqm,
            hash,
            registered: false,
        }
    }
}

impl Future for HashQuery {
    type Output = Option<Blob>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Blob>> {
        let this = self.get_mut();
        let mut bqm = this.bqm.borrow_mut();
        if let Some(answer) = bqm.check_hash(&this.hash) {
            return Poll::Ready(answer);
        }
        if !this.registered {
            bqm.enqueue_hash(this.hash.clone(), cx.waker().clone());
            this.registered = true;
        }
        Poll::Pending
    }
}
