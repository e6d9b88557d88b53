//! The cooperative scheduler driving every in-flight per-file ingest task: a
//! minimal single-threaded executor whose only suspension points are the
//! Batch Query Manager's [`SizeQuery`](crate::bqm::SizeQuery) and
//! [`HashQuery`](crate::bqm::HashQuery) futures.
//!
//! Built on Rust's own `Future`/`Wake` machinery rather than a bespoke
//! hand-rolled state machine, keeping every per-file task written as
//! ordinary `async fn` code. The one
//! wrinkle is that the tasks hold an `Rc<RefCell<Bqm>>` and so aren't `Send`,
//! while `std::task::Wake` requires `Send + Sync` — resolved by having the
//! waker carry only a task index and a `Send`-safe ready queue, never the
//! `Bqm` itself.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use anyhow::Result;

use crate::bqm::Bqm;
use crate::catalog::CatalogSession;

/// Wakes the scheduler's main loop by pushing a task's index onto the ready
/// queue. `Send + Sync` so it satisfies `Wake`, even though the task it
/// represents is not.
struct IndexWaker {
    index: usize,
    ready: Arc<Mutex<VecDeque<usize>>>,
}

impl Wake for IndexWaker {
    fn wake(self: Arc<Self>) {
        self.ready.lock().unwrap().push_front(self.index);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.lock().unwrap().push_front(self.index);
    }
}

pub(crate) type BoxedTask<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Drives every task in `tasks` to completion, returning one output per task
/// in the same order they were given — callers index results by the task's
/// original position, not by completion order.
///
/// The loop alternates between: polling whatever's ready, and — once the
/// ready queue runs dry with requests still pending — unconditionally
/// flushing the [`Bqm`] to force those requests through. Fairness across
/// tasks isn't attempted beyond the BQM's own
/// reverse-enqueue wake order; this is a throughput, not a real-time,
/// scheduler.
pub fn drive<'a, T>(bqm: Rc<RefCell<Bqm>>, cs: &CatalogSession, tasks: Vec<BoxedTask<'a, T>>) -> Result<Vec<T>> {
    let n = tasks.len();
    let mut slots: Vec<Option<BoxedTask<'a, T>>> = tasks.into_iter().map(Some).collect();
    let mut results: Vec<Option<T>> = (0..n).map(|_| None).collect();
    let ready: Arc<Mutex<VecDeque<usize>>> = Arc::new(Mutex::new((0..n).collect()));
    let wakers: Vec<Waker> = (0..n)
        .map(|i| {
            Waker::from(Arc::new(IndexWaker {
                index: i,
                ready: ready.clone(),
            }))
        })
        .collect();

    let mut remaining = n;
    while remaining > 0 {
        let next = ready.lock().unwrap().pop_front();
        let Some(idx) = next else {
            if bqm.borrow().is_idle() {
                // Nothing ready and nothing batched: every remaining task
                // must be stuck on a request that was never enqueued, which
                // would be a scheduler bug rather than a normal state.
                break;
            }
            bqm.borrow_mut().flush(cs)?;
            crate::counters::bump(crate::counters::Op::BqmIdleFlush);
            continue;
        };

        let Some(mut task) = slots[idx].take() else {
            // Already completed; a duplicate wake can still land here.
            continue;
        };
        let mut cx = Context::from_waker(&wakers[idx]);
        match task.as_mut().poll(&mut cx) {
            Poll::Ready(output) => {
                results[idx] = Some(output);
                remaining -= 1;
            }
            Poll::Pending => {
                slots[idx] = Some(task);
            }
        }

        bqm.borrow_mut().flush_if_needed(cs)?;
    }

    Ok(results.into_iter().flatten().collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bqm::SizeQuery;
    use crate::catalog::CatalogSession;
    use crate::compress::CompressMethod;
    use crate::hashing::Fingerprint;

    #[test]
    fn drives_queries_to_completion_in_order() -> Result<()> {
        let cs = CatalogSession::open_in_memory()?;
        cs.create_blob_or_get(Fingerprint::hash(b"x"), CompressMethod::Plain, 5, 5)?;
        cs.create_blob_or_get(Fingerprint::hash(b"y"), CompressMethod::Plain, 7, 7)?;

        let bqm = Rc::new(RefCell::new(Bqm::new()));
        let sizes = [5u64, 9999, 7];
        let tasks: Vec<BoxedTask<'_, bool>> = sizes
            .iter()
            .map(|&s| {
                let bqm = bqm.clone();
                Box::pin(async move { SizeQuery::new(bqm, s).await }) as BoxedTask<'_, bool>
            })
            .collect();

        let results = drive(bqm, &cs, tasks)?;
        assert_eq!(results, vec![true, false, true]);
        Ok(())
    }

    #[test]
    fn empty_task_list_returns_empty() -> Result<()> {
        let cs = CatalogSession::open_in_memory()?;
        let bqm = Rc::new(RefCell::new(Bqm::new()));
        let tasks: Vec<BoxedTask<'_, ()>> = Vec::new();
        let results = drive(bqm, &cs, tasks)?;
        assert!(results.is_empty());
        Ok(())
    }
}
