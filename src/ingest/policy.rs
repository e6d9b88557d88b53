//! Per-file ingest policy selection: the decision table that picks one of
//! four blob-acquisition strategies for a regular file, evaluated top-down,
//! first match wins.

use std::fmt;

use crate::config::{HASH_ONCE_THRESHOLD, READ_ALL_THRESHOLD};

/// One of the four ingest strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    ReadAll,
    HashOnce,
    CopyHash,
    Default,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Policy::ReadAll => "read_all",
            Policy::HashOnce => "hash_once",
            Policy::CopyHash => "copy_hash",
            Policy::Default => "default",
        };
        write!(f, "{s}")
    }
}

/// Picks a policy given everything the decision table conditions on. The
/// `blob_with_size_exists` check is only consulted for the `hash_once`
/// branch — callers must have already resolved that lookup (possibly via a
/// BQM suspension) before calling this, since size-lookup yields must
/// precede policy selection.
#[allow(clippy::too_many_arguments)]
pub fn select(
    last_chance: bool,
    has_precomputed_hash: bool,
    can_cow: bool,
    size: u64,
    blob_with_size_exists: bool,
) -> Policy {
    if last_chance {
        return Policy::CopyHash;
    }
    if has_precomputed_hash {
        return Policy::Default;
    }
    if !can_cow && size <= READ_ALL_THRESHOLD {
        return Policy::ReadAll;
    }
    if !can_cow && size > HASH_ONCE_THRESHOLD && !blob_with_size_exists {
        return Policy::HashOnce;
    }
    Policy::Default
}

/// Whether [`select`] needs a `blob_by_size` existence answer to decide:
/// only the "would this land on `hash_once`?" branch cares.
pub fn needs_size_lookup(last_chance: bool, has_precomputed_hash: bool, can_cow: bool, size: u64) -> bool {
    !last_chance && !has_precomputed_hash && !can_cow && size > HASH_ONCE_THRESHOLD
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn last_chance_always_wins() {
        assert_eq!(select(true, true, true, 0, true), Policy::CopyHash);
    }

    #[test]
    fn precomputed_hash_picks_default() {
        assert_eq!(select(false, true, false, 999_999_999, false), Policy::Default);
    }

    #[test]
    fn tiny_file_without_cow_reads_all() {
        assert_eq!(select(false, false, false, READ_ALL_THRESHOLD, false), Policy::ReadAll);
    }

    #[test]
    fn boundary_plus_one_is_not_read_all() {
        assert_eq!(
            select(false, false, false, READ_ALL_THRESHOLD + 1, false),
            Policy::Default
        );
    }

    #[test]
    fn large_unique_size_without_cow_is_hash_once() {
        assert_eq!(
            select(false, false, false, HASH_ONCE_THRESHOLD + 1, false),
            Policy::HashOnce
        );
    }

    #[test]
    fn large_colliding_size_without_cow_is_default() {
        assert_eq!(
            select(false, false, false, HASH_ONCE_THRESHOLD + 1, true),
            Policy::Default
        );
    }

    #[test]
    fn cow_capable_medium_file_is_default() {
        assert_eq!(select(false, false, true, 1, false), Policy::Default);
    }

    #[test]
    fn needs_size_lookup_matches_hash_once_condition() {
        assert!(needs_size_lookup(false, false, false, HASH_ONCE_THRESHOLD + 1));
        assert!(!needs_size_lookup(false, false, false, READ_ALL_THRESHOLD));
        assert!(!needs_size_lookup(false, true, false, HASH_ONCE_THRESHOLD + 1));
        assert!(!needs_size_lookup(true, false, false, HASH_ONCE_THRESHOLD + 1));
        assert!(!needs_size_lookup(false, false, true, HASH_ONCE_THRESHOLD + 1));
    }
}
