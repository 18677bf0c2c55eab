//! Decision cache behaviour.

use execguard::policy::cache::DecisionCache;
use execguard::policy::Verdict;

#[test]
fn last_writer_wins() {
    let cache = DecisionCache::new();
    cache.insert("/bin/a", Verdict::Deny);
    cache.insert("/bin/a", Verdict::Allow);
    assert_eq!(cache.get("/bin/a"), Some(Verdict::Allow));
    assert_eq!(cache.len(), 1);
}

#[test]
fn invalidate_directory_drops_entries_beneath_it() {
    let cache = DecisionCache::new();
    cache.insert("/Apps/X.app/Contents/MacOS/X", Verdict::Deny);
    cache.insert("/Apps/X.application", Verdict::Allow);
    cache.insert("/bin/ls", Verdict::Allow);

    assert_eq!(cache.invalidate("/Apps/X.app"), 1);
    assert_eq!(cache.get("/Apps/X.app/Contents/MacOS/X"), None);
    assert_eq!(cache.get("/Apps/X.application"), Some(Verdict::Allow));
    assert_eq!(cache.get("/bin/ls"), Some(Verdict::Allow));
}

#[test]
fn clear_empties() {
    let cache = DecisionCache::new();
    cache.insert("/bin/a", Verdict::Deny);
    cache.clear();
    assert!(cache.is_empty());
}
