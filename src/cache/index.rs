//! The cache index: an ordered set of entries keyed by path, secondarily
//! ordered by last-access timestamp.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// Name of the persisted index sentinel at the cache tier root.
pub const INDEX_FILE: &str = ".cacheindex";

/// One cached regular file.
///
/// `last_access_time` is microseconds since the Unix epoch; it doubles as
/// the eviction score and the `.cacheindex` wire value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Logical path within both tiers.
    pub path: PathBuf,
    /// Size of the cached copy in bytes.
    pub size: u64,
    /// Last-access timestamp, microseconds since the Unix epoch.
    pub last_access_time: i64,
}

impl CacheEntry {
    /// Create an entry.
    pub fn new(path: impl Into<PathBuf>, size: u64, last_access_time: i64) -> Self {
        Self {
            path: path.into(),
            size,
            last_access_time,
        }
    }
}

/// Path-keyed set of [`CacheEntry`] with pop-minimum by timestamp.
///
/// Ties on the timestamp break toward the lexicographically smaller path,
/// which the `(score, path)` tuple ordering gives for free. `current_size`
/// is maintained as the sum of member sizes.
#[derive(Debug, Default)]
pub struct CacheIndex {
    by_path: HashMap<PathBuf, CacheEntry>,
    by_score: BTreeSet<(i64, PathBuf)>,
    current_size: u64,
}

impl CacheIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    /// Whether the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    /// Sum of the sizes of all entries.
    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    /// Whether `path` is indexed.
    pub fn contains(&self, path: &Path) -> bool {
        self.by_path.contains_key(path)
    }

    /// Look up an entry by path.
    pub fn get(&self, path: &Path) -> Option<&CacheEntry> {
        self.by_path.get(path)
    }

    /// Insert or replace the entry for its path, adjusting `current_size`
    /// either way.
    pub fn insert(&mut self, entry: CacheEntry) {
        self.remove(&entry.path);
        self.by_score
            .insert((entry.last_access_time, entry.path.clone()));
        self.current_size += entry.size;
        self.by_path.insert(entry.path.clone(), entry);
    }

    /// Remove the entry for `path`, subtracting its size.
    pub fn remove(&mut self, path: &Path) -> Option<CacheEntry> {
        let entry = self.by_path.remove(path)?;
        self.by_score
            .remove(&(entry.last_access_time, entry.path.clone()));
        self.current_size = self.current_size.saturating_sub(entry.size);
        Some(entry)
    }

    /// Remove and return the minimum-scored entry.
    pub fn pop_min(&mut self) -> Option<CacheEntry> {
        let (_, path) = self.by_score.iter().next().cloned()?;
        self.remove(&path)
    }

    /// All entries in ascending score order.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.by_score
            .iter()
            .filter_map(|(_, path)| self.by_path.get(path).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, size: u64, ts: i64) -> CacheEntry {
        CacheEntry::new(path, size, ts)
    }

    #[test]
    fn pop_min_follows_timestamps() {
        let mut index = CacheIndex::new();
        index.insert(entry("b.txt", 10, 300));
        index.insert(entry("a.txt", 10, 100));
        index.insert(entry("c.txt", 10, 200));

        assert_eq!(index.pop_min().unwrap().path, Path::new("a.txt"));
        assert_eq!(index.pop_min().unwrap().path, Path::new("c.txt"));
        assert_eq!(index.pop_min().unwrap().path, Path::new("b.txt"));
        assert!(index.pop_min().is_none());
    }

    #[test]
    fn equal_timestamps_break_on_path() {
        let mut index = CacheIndex::new();
        index.insert(entry("z.txt", 10, 100));
        index.insert(entry("a.txt", 10, 100));

        assert_eq!(index.pop_min().unwrap().path, Path::new("a.txt"));
        assert_eq!(index.pop_min().unwrap().path, Path::new("z.txt"));
    }

    #[test]
    fn insert_is_an_upsert() {
        let mut index = CacheIndex::new();
        index.insert(entry("a.txt", 10, 100));
        assert_eq!(index.current_size(), 10);

        index.insert(entry("a.txt", 25, 400));
        assert_eq!(index.len(), 1);
        assert_eq!(index.current_size(), 25);
        assert_eq!(index.get(Path::new("a.txt")).unwrap().last_access_time, 400);
    }

    #[test]
    fn remove_adjusts_size() {
        let mut index = CacheIndex::new();
        index.insert(entry("a.txt", 10, 100));
        index.insert(entry("b.txt", 30, 200));
        assert_eq!(index.current_size(), 40);

        let removed = index.remove(Path::new("a.txt")).unwrap();
        assert_eq!(removed.size, 10);
        assert_eq!(index.current_size(), 30);
        assert!(index.remove(Path::new("a.txt")).is_none());
    }

    #[test]
    fn entries_are_score_ordered() {
        let mut index = CacheIndex::new();
        index.insert(entry("late.txt", 1, 900));
        index.insert(entry("early.txt", 1, 100));
        index.insert(entry("mid.txt", 1, 500));

        let paths: Vec<_> = index.entries().into_iter().map(|e| e.path).collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("early.txt"),
                PathBuf::from("mid.txt"),
                PathBuf::from("late.txt")
            ]
        );
    }

    #[test]
    fn wire_format_round_trips() {
        let mut index = CacheIndex::new();
        index.insert(entry("a/b.txt", 10, 123_456));
        index.insert(entry("c.txt", 20, 789_012));

        let data = serde_json::to_vec(&index.entries()).unwrap();
        let parsed: Vec<CacheEntry> = serde_json::from_slice(&data).unwrap();

        let mut rebuilt = CacheIndex::new();
        for e in parsed {
            rebuilt.insert(e);
        }
        assert_eq!(rebuilt.current_size(), index.current_size());
        assert_eq!(rebuilt.entries(), index.entries());
    }
}
