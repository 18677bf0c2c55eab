//! Policy store: replacement, overrides, grants, and expiry.

use chrono::{Duration, Utc};

use execguard::identity::Digest;
use execguard::policy::{BlockedEntry, PolicyStore, Verdict};

fn entry(name: &str, content: &[u8]) -> BlockedEntry {
    BlockedEntry {
        identifier: format!("com.example.{name}"),
        path: format!("/Applications/{name}.app/Contents/MacOS/{name}"),
        digest: Digest::of_bytes(content),
    }
}

fn one_second_ago() -> chrono::DateTime<Utc> {
    Utc::now()
        .checked_sub_signed(Duration::seconds(1))
        .expect("one second ago should be representable")
}

#[test]
fn replace_policy_drops_digests_missing_from_new_set() {
    let store = PolicyStore::new();
    let old = entry("Old", b"old");
    let new = entry("New", b"new");

    store.replace_policy(&[old.clone()]);
    assert!(store.is_blocked(&old.digest));

    let summary = store.replace_policy(&[new.clone()]);
    assert_eq!(summary.digests, 1);
    assert!(!store.is_blocked(&old.digest));
    assert!(store.is_blocked(&new.digest));
}

#[test]
fn replace_policy_merges_path_mappings() {
    let store = PolicyStore::new();
    let first = entry("First", b"one");
    store.replace_policy(&[first.clone()]);

    let mut moved = entry("First", b"two");
    moved.path = first.path.clone();
    store.replace_policy(&[moved.clone()]);

    assert_eq!(store.digest_for_path(&first.path), Some(moved.digest));
}

#[test]
fn temporary_allow_wins_over_block_until_expiry() {
    let store = PolicyStore::new();
    let blocked = entry("App", b"payload");
    store.replace_policy(&[blocked.clone()]);
    assert_eq!(store.classify(&blocked.digest), Verdict::Deny);

    store.allow_temporarily(blocked.digest.clone(), Duration::seconds(10));
    assert!(store.is_temporarily_allowed(&blocked.digest));
    assert_eq!(store.classify(&blocked.digest), Verdict::Allow);

    let past = one_second_ago();
    store.allow_temporarily_until(blocked.digest.clone(), past);
    assert_eq!(store.classify(&blocked.digest), Verdict::Deny);
    // The expired entry is removed by the lookup itself.
    assert_eq!(store.temporary_allow_count(), 0);
}

#[test]
fn fast_verdict_needs_known_path_with_decisive_digest() {
    let store = PolicyStore::new();
    let blocked = entry("App", b"payload");
    assert_eq!(store.fast_verdict(&blocked.path), None);

    store.replace_policy(&[blocked.clone()]);
    assert_eq!(
        store.fast_verdict(&blocked.path),
        Some((blocked.digest.clone(), Verdict::Deny))
    );

    store.record_path_digest("/usr/bin/ok", Digest::of_bytes(b"ok"));
    assert_eq!(store.fast_verdict("/usr/bin/ok"), None);
}

#[test]
fn caller_grant_expires() {
    let store = PolicyStore::new();
    store.grant_caller_access(42, Duration::seconds(5));
    assert!(store.is_caller_allowed(42));
    assert!(!store.is_caller_allowed(43));

    store.grant_caller_access(44, Duration::seconds(-1));
    assert!(!store.is_caller_allowed(44));
}

#[test]
fn sweep_removes_only_expired_entries() {
    let store = PolicyStore::new();
    let live = Digest::of_bytes(b"live");
    let dead = Digest::of_bytes(b"dead");
    store.allow_temporarily(live.clone(), Duration::seconds(60));
    store.allow_temporarily_until(dead, one_second_ago());
    store.grant_caller_access(1, Duration::seconds(60));
    store.grant_caller_access(2, Duration::seconds(-1));

    let swept = store.sweep_expired();
    assert_eq!(swept.temporary_allows, 1);
    assert_eq!(swept.caller_grants, 1);
    assert!(store.is_temporarily_allowed(&live));
    assert!(store.is_caller_allowed(1));
}

#[test]
fn forget_path_drops_descendants() {
    let store = PolicyStore::new();
    store.record_path_digest("/Apps/X.app/Contents/MacOS/X", Digest::of_bytes(b"x"));
    store.record_path_digest("/Apps/Y.app/Contents/MacOS/Y", Digest::of_bytes(b"y"));

    assert_eq!(store.forget_path("/Apps/X.app"), 1);
    assert_eq!(store.digest_for_path("/Apps/X.app/Contents/MacOS/X"), None);
    assert!(store.digest_for_path("/Apps/Y.app/Contents/MacOS/Y").is_some());
}
