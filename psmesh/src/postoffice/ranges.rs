//! Partition of the key space across servers.

use std::fmt;

use crate::MAX_KEY;

/// Half-open key interval `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyRange {
    /// First key.
    pub begin: u64,
    /// One past the last key.
    pub end: u64,
}

impl KeyRange {
    /// Create a range.
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    /// Number of keys.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    /// True when the range holds no key.
    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }

    /// Whether `key` falls inside.
    pub fn contains(&self, key: u64) -> bool {
        self.begin <= key && key < self.end
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

/// Split `[0, MAX_KEY)` into `num_servers` contiguous ranges.
///
/// Range `i` is `[MAX_KEY / n * i, MAX_KEY / n * (i + 1))`; the integer
/// division remainder past the last range belongs to no server.
pub(crate) fn server_key_ranges(num_servers: usize) -> Vec<KeyRange> {
    if num_servers == 0 {
        return Vec::new();
    }
    let n = num_servers as u64;
    let step = MAX_KEY / n;
    (0..n)
        .map(|i| KeyRange::new(step * i, step * (i + 1)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_are_contiguous() {
        for n in 1..=7 {
            let ranges = server_key_ranges(n);
            assert_eq!(ranges.len(), n);
            assert_eq!(ranges[0].begin, 0);
            for (i, range) in ranges.iter().enumerate() {
                assert_eq!(range.begin, MAX_KEY / n as u64 * i as u64);
                assert!(!range.is_empty());
            }
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].end, pair[1].begin);
            }
            let last = ranges[n - 1];
            assert_eq!(last.end, MAX_KEY / n as u64 * n as u64);
        }
    }

    #[test]
    fn test_no_servers() {
        assert!(server_key_ranges(0).is_empty());
    }

    #[test]
    fn test_contains() {
        let ranges = server_key_ranges(2);
        let mid = MAX_KEY / 2;
        assert!(ranges[0].contains(mid - 1));
        assert!(!ranges[0].contains(mid));
        assert!(ranges[1].contains(mid));
        assert_eq!(ranges[1].to_string(), format!("[{mid}, {})", mid * 2));
    }
}
