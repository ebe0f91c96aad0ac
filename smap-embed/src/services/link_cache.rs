//! Persistent (title, artists) → source URL cache
//!
//! The whole cache lives in memory behind a `RwLock` and is mirrored to an
//! append-only TSV file (`Query Key\tUrl`). Inserts append one line and sync
//! before returning, so a crash loses at most the insert in progress.
//!
//! Entries are never overwritten by `insert`: a different URL for a known key
//! is a conflict and the existing entry wins. `invalidate` is the only removal.

use crate::error::LinkCacheError;
use crate::models::LinkKey;
use crate::utils::tsv::{append_synced, complete_len, format_row, split_row, write_atomic};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Link cache file header
pub const LINK_CACHE_HEADER: [&str; 2] = ["Query Key", "Url"];

/// Result of a successful insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheInsert {
    /// New entry persisted
    Inserted,
    /// Same key already mapped to the same URL
    AlreadyPresent,
}

struct CacheState {
    entries: HashMap<LinkKey, String>,
    file: File,
}

/// Link cache backed by a TSV file
pub struct LinkCache {
    path: PathBuf,
    state: RwLock<CacheState>,
}

impl LinkCache {
    /// Open or create the cache file and load every entry
    ///
    /// A trailing partial line (interrupted append) is truncated away.
    /// Duplicate keys in the file resolve first-wins.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LinkCacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut entries = HashMap::new();

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let complete = complete_len(&bytes);
                if complete < bytes.len() {
                    warn!(
                        path = %path.display(),
                        dropped_bytes = bytes.len() - complete,
                        "Truncating partial trailing line in link cache"
                    );
                    let file = OpenOptions::new().write(true).open(&path).await?;
                    file.set_len(complete as u64).await?;
                    file.sync_all().await?;
                }

                let content = String::from_utf8_lossy(&bytes[..complete]);
                let mut lines = content.lines();
                match lines.next() {
                    Some(header) if split_row(header) == LINK_CACHE_HEADER => {}
                    Some(header) => {
                        return Err(LinkCacheError::Schema {
                            path: path.display().to_string(),
                            found: header.to_string(),
                        })
                    }
                    None => {
                        // Empty file: write the header
                        let mut file = OpenOptions::new().write(true).open(&path).await?;
                        file.write_all(format_row(LINK_CACHE_HEADER).as_bytes()).await?;
                        file.sync_all().await?;
                    }
                }

                for (line_no, line) in lines.enumerate().map(|(i, l)| (i + 2, l)) {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let cells = split_row(line);
                    if cells.len() != 2 || cells[1].trim().is_empty() {
                        warn!(path = %path.display(), line = line_no, "Skipping malformed link cache line");
                        continue;
                    }
                    let key = LinkKey::from_cell(cells[0]);
                    let url = cells[1].trim().to_string();
                    if let Some(existing) = entries.get(&key) {
                        if existing != &url {
                            warn!(
                                key = %key,
                                existing = %existing,
                                ignored = %url,
                                "Duplicate link cache key in file, keeping first"
                            );
                        }
                        continue;
                    }
                    entries.insert(key, url);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut file = File::create(&path).await?;
                file.write_all(format_row(LINK_CACHE_HEADER).as_bytes()).await?;
                file.sync_all().await?;
                info!(path = %path.display(), "Created link cache");
            }
            Err(e) => return Err(e.into()),
        }

        let file = OpenOptions::new().append(true).open(&path).await?;
        info!(path = %path.display(), entries = entries.len(), "Link cache loaded");

        Ok(Self {
            path,
            state: RwLock::new(CacheState { entries, file }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn lookup(&self, key: &LinkKey) -> Option<String> {
        self.state.read().await.entries.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Insert a mapping without ever overwriting an existing one
    ///
    /// The line is flushed and synced before `Inserted` is returned.
    pub async fn insert(&self, key: LinkKey, url: &str) -> Result<CacheInsert, LinkCacheError> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.entries.get(&key) {
            if existing == url {
                return Ok(CacheInsert::AlreadyPresent);
            }
            warn!(
                key = %key,
                existing = %existing,
                rejected = %url,
                "Link cache conflict, keeping existing entry"
            );
            return Err(LinkCacheError::Conflict {
                key: key.to_string(),
                existing: existing.clone(),
                rejected: url.to_string(),
            });
        }

        let line = format_row([key.as_str(), url]);
        append_synced(&mut state.file, line.as_bytes()).await?;
        state.entries.insert(key.clone(), url.to_string());

        debug!(key = %key, url, "Link cache entry added");
        Ok(CacheInsert::Inserted)
    }

    /// Remove an entry and rewrite the file atomically
    ///
    /// Returns the removed URL, if any.
    pub async fn invalidate(&self, key: &LinkKey) -> Result<Option<String>, LinkCacheError> {
        let mut state = self.state.write().await;

        let removed = match state.entries.remove(key) {
            Some(url) => url,
            None => return Ok(None),
        };

        let mut sorted: Vec<_> = state.entries.iter().collect();
        sorted.sort();
        let mut content = format_row(LINK_CACHE_HEADER);
        for (k, url) in sorted {
            content.push_str(&format_row([k.as_str(), url.as_str()]));
        }

        let path = self.path.clone();
        let rewrite = tokio::task::spawn_blocking(move || write_atomic(&path, content.as_bytes()))
            .await
            .map_err(|e| std::io::Error::other(format!("Rewrite task failed: {}", e)));

        if let Err(e) = rewrite.and_then(|r| r) {
            // Keep memory consistent with the file we failed to replace
            state.entries.insert(key.clone(), removed);
            return Err(e.into());
        }

        // The old append handle points at the replaced inode
        state.file = OpenOptions::new().append(true).open(&self.path).await?;

        info!(key = %key, url = %removed, "Link cache entry invalidated");
        Ok(Some(removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(title: &str) -> LinkKey {
        LinkKey::new(title, "Artist")
    }

    #[tokio::test]
    async fn test_insert_lookup_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("links.tsv");

        let cache = LinkCache::open(&path).await.unwrap();
        assert!(cache.is_empty().await);
        assert_eq!(
            cache.insert(key("One"), "https://v/1").await.unwrap(),
            CacheInsert::Inserted
        );
        assert_eq!(
            cache.insert(key("one "), "https://v/1").await.unwrap(),
            CacheInsert::AlreadyPresent
        );
        drop(cache);

        let reopened = LinkCache::open(&path).await.unwrap();
        assert_eq!(reopened.lookup(&key("ONE")).await, Some("https://v/1".to_string()));
        assert_eq!(reopened.len().await, 1);
    }

    #[tokio::test]
    async fn test_conflict_keeps_existing_and_file_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("links.tsv");
        let cache = LinkCache::open(&path).await.unwrap();

        cache.insert(key("Song"), "https://v/a").await.unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        let err = cache.insert(key("Song"), "https://v/b").await.unwrap_err();
        match err {
            LinkCacheError::Conflict { existing, rejected, .. } => {
                assert_eq!(existing, "https://v/a");
                assert_eq!(rejected, "https://v/b");
            }
            other => panic!("unexpected error {:?}", other),
        }

        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
        assert_eq!(cache.lookup(&key("Song")).await, Some("https://v/a".to_string()));
    }

    #[tokio::test]
    async fn test_invalidate_rewrites_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("links.tsv");
        let cache = LinkCache::open(&path).await.unwrap();

        cache.insert(key("A"), "https://v/a").await.unwrap();
        cache.insert(key("B"), "https://v/b").await.unwrap();

        assert_eq!(
            cache.invalidate(&key("A")).await.unwrap(),
            Some("https://v/a".to_string())
        );
        assert_eq!(cache.invalidate(&key("A")).await.unwrap(), None);

        // Appends after invalidation land in the new file
        cache.insert(key("A"), "https://v/a2").await.unwrap();
        drop(cache);

        let reopened = LinkCache::open(&path).await.unwrap();
        assert_eq!(reopened.lookup(&key("A")).await, Some("https://v/a2".to_string()));
        assert_eq!(reopened.lookup(&key("B")).await, Some("https://v/b".to_string()));
    }

    #[tokio::test]
    async fn test_duplicate_keys_in_file_first_wins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("links.tsv");
        std::fs::write(
            &path,
            "Query Key\tUrl\nsong :: artist\thttps://v/first\nsong :: artist\thttps://v/second\n",
        )
        .unwrap();

        let cache = LinkCache::open(&path).await.unwrap();
        assert_eq!(
            cache.lookup(&LinkKey::new("Song", "Artist")).await,
            Some("https://v/first".to_string())
        );
    }

    #[tokio::test]
    async fn test_partial_trailing_line_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("links.tsv");
        std::fs::write(&path, "Query Key\tUrl\na :: b\thttps://v/1\nc :: d\thttps://v/").unwrap();

        let cache = LinkCache::open(&path).await.unwrap();
        assert_eq!(cache.len().await, 1);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "Query Key\tUrl\na :: b\thttps://v/1\n"
        );
    }

    #[tokio::test]
    async fn test_bad_header_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("links.tsv");
        std::fs::write(&path, "Song ID\tYouTube Link\n").unwrap();
        assert!(matches!(
            LinkCache::open(&path).await,
            Err(LinkCacheError::Schema { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_inserts_single_winner() {
        let dir = TempDir::new().unwrap();
        let cache = std::sync::Arc::new(
            LinkCache::open(dir.path().join("links.tsv")).await.unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.insert(key("Race"), &format!("https://v/{}", i)).await
            }));
        }

        let mut inserted = 0;
        for handle in handles {
            if let Ok(CacheInsert::Inserted) = handle.await.unwrap() {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
    }
}
