use std::collections::HashSet;
use std::hash::Hash;
use std::time::Duration;

/// Requeue applied to every reconcile that does not ask for its own.
/// Watches alone can starve for hours; a periodic resync caps the drift
/// between cluster state and the management API.
pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(15 * 60);

/// All of `xs` in the same order, without any element equal to `y`.
pub fn without<T: PartialEq + Clone>(xs: &[T], y: &T) -> Vec<T> {
    xs.iter().filter(|v| *v != y).cloned().collect()
}

/// Order-insensitive slice equality. Duplicates collapse, matching how the
/// management API treats group and port sets.
pub fn equivalent<T: Eq + Hash>(x: &[T], y: &[T]) -> bool {
    if x.len() != y.len() {
        return false;
    }
    let set: HashSet<&T> = x.iter().collect();
    y.iter().all(|v| set.contains(v))
}

/// Lowercase RFC-1123 label derived from a free-form group name.
pub fn rfc1123_label(name: &str) -> String {
    name.to_lowercase().replace(' ', "-")
}

/// Split a comma-separated annotation value into trimmed, non-empty parts.
pub fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
