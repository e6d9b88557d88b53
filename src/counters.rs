//! Performance counters: count how many times we do various important operations.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

use enum_map::{Enum, EnumMap};
use tracing::debug;

#[derive(Debug, Copy, Clone, Enum)]
pub enum Op {
    PolicyReadAll,
    PolicyHashOnce,
    PolicyCopyHash,
    PolicyDefault,
    DedupPrewriteHit,
    DedupPostwriteHit,
    StatReuseHit,
    StatReuseMiss,
    CowCopy,
    BlobFileChangedRetry,
    BqmBatchFlush,
    BqmIdleFlush,
}

static COUNTER_MAP: LazyLock<EnumMap<Op, AtomicUsize>> = LazyLock::new(EnumMap::default);

#[inline]
pub fn bump(which: Op) {
    add(which, 1);
}

pub fn add(to: Op, amount: usize) {
    COUNTER_MAP[to].fetch_add(amount, Ordering::Relaxed);
}

pub fn log_counts() {
    // Probably not needed; but we're probably calling this once at program exit.
    fence(Ordering::SeqCst);

    let counts = COUNTER_MAP
        .iter()
        .map(|(k, v)| (k, v.load(Ordering::Relaxed)))
        .filter(|(_k, v)| *v > 0) // Ignore things we didn't do
        .collect::<Vec<_>>();

    if counts.is_empty() {
        return;
    }

    let opname = |op| match op {
        Op::PolicyReadAll => "files ingested via read_all",
        Op::PolicyHashOnce => "files ingested via hash_once",
        Op::PolicyCopyHash => "files ingested via copy_hash",
        Op::PolicyDefault => "files ingested via default",
        Op::DedupPrewriteHit => "blobs deduplicated before writing",
        Op::DedupPostwriteHit => "blobs deduplicated after writing",
        Op::StatReuseHit => "files reused by stat",
        Op::StatReuseMiss => "files not reused by stat",
        Op::CowCopy => "copy-on-write reflinks taken",
        Op::BlobFileChangedRetry => "blob acquisition retries",
        Op::BqmBatchFlush => "batch query manager flushes",
        Op::BqmIdleFlush => "batch query manager idle flushes",
    };

    debug!("Counters:");
    for (op, count) in &counts {
        debug!("{:6} {}", count, opname(*op));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bump_and_add_accumulate() {
        let before = COUNTER_MAP[Op::CowCopy].load(Ordering::Relaxed);
        bump(Op::CowCopy);
        add(Op::CowCopy, 4);
        let after = COUNTER_MAP[Op::CowCopy].load(Ordering::Relaxed);
        assert_eq!(after - before, 5);
    }
}
