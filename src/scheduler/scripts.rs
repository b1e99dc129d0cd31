//! Server-side Lua scripts of the queue protocol.
//!
//! `redis::Script` invokes by `EVALSHA` and loads the body with
//! `SCRIPT LOAD` when the server answers `NOSCRIPT`.

use std::sync::LazyLock;

use redis::Script;

pub const CLAIM_SOURCE: &str = include_str!("scripts/claim.lua");
pub const PROMOTE_SOURCE: &str = include_str!("scripts/promote.lua");
pub const REQUEUE_SOURCE: &str = include_str!("scripts/requeue.lua");

/// Stamp processing metadata after `BLMOVE`.
pub static CLAIM: LazyLock<Script> = LazyLock::new(|| Script::new(CLAIM_SOURCE));

/// Remove from inflight, write evidence, push to the next queue.
pub static PROMOTE: LazyLock<Script> = LazyLock::new(|| Script::new(PROMOTE_SOURCE));

/// Requeue, release or fail a claimed job.
pub static REQUEUE: LazyLock<Script> = LazyLock::new(|| Script::new(REQUEUE_SOURCE));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_have_distinct_hashes() {
        let hashes = [CLAIM.get_hash(), PROMOTE.get_hash(), REQUEUE.get_hash()];
        assert_ne!(hashes[0], hashes[1]);
        assert_ne!(hashes[1], hashes[2]);
        assert!(hashes.iter().all(|h| h.len() == 40));
    }

    #[test]
    fn test_promote_removes_before_push() {
        let lrem = PROMOTE_SOURCE.find("LREM', ARGV[1]").expect("dedup before push");
        let lpush = PROMOTE_SOURCE.find("LPUSH', ARGV[1]").expect("push");
        assert!(lrem < lpush);
    }

    #[test]
    fn test_requeue_reports_every_outcome() {
        for outcome in ["requeued", "failed", "orphaned", "not_inflight", "fresh"] {
            assert!(REQUEUE_SOURCE.contains(&format!("'{}'", outcome)));
        }
    }
}
