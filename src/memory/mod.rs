//! Opaque memory service seam.
//!
//! The core treats long-term memory as a `retrieve`/`store` service. Text
//! is normalized into overlapping chunks before storage so every backend
//! receives the same shape; retrieval relevance is the backend's concern.
//! [`InMemoryStore`] is the bundled backend used in tests and for running
//! without a vector store.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::config::MemoryConfig;
use crate::error::{CoreError, Result};

/// One retrieved memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memory {
    /// Backend identifier, used for cross-query deduplication.
    pub id: String,
    /// The remembered text.
    pub text: String,
}

/// Retrieve/store seam over the memory backend.
#[async_trait]
pub trait MemoryService: Send + Sync {
    /// Retrieve up to `limit` memories relevant to the query.
    async fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<Memory>>;

    /// Store a text, returning the ids of the chunks written.
    async fn store(&self, text: &str) -> Result<Vec<String>>;
}

/// Splits long text into bounded chunks with overlap, so adjacent chunks
/// share context.
#[derive(Debug, Clone)]
pub struct TextChunker {
    chunk_size: usize,
    overlap: usize,
}

impl TextChunker {
    /// Create a chunker; the overlap is clamped below the chunk size.
    pub fn new(config: &MemoryConfig) -> Self {
        let chunk_size = config.chunk_size.max(1);
        Self {
            chunk_size,
            overlap: config.chunk_overlap.min(chunk_size - 1),
        }
    }

    /// Split `text` into chunks of at most `chunk_size` characters, each
    /// starting `chunk_size - overlap` characters after the previous one.
    pub fn split(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        if chars.is_empty() {
            return Vec::new();
        }
        if chars.len() <= self.chunk_size {
            return vec![text.to_owned()];
        }
        let stride = self.chunk_size - self.overlap;
        let mut chunks = Vec::new();
        let mut start = 0;
        while start < chars.len() {
            let end = (start + self.chunk_size).min(chars.len());
            chunks.push(chars[start..end].iter().collect());
            if end == chars.len() {
                break;
            }
            start += stride;
        }
        chunks
    }
}

/// Keyword-overlap backend holding memories in process memory.
pub struct InMemoryStore {
    chunker: TextChunker,
    entries: Mutex<Vec<Memory>>,
    next_id: AtomicU64,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            chunker: TextChunker::new(config),
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn score(query: &str, text: &str) -> usize {
        // Short ASCII tokens are mostly function words; CJK matches are
        // scored per character instead.
        let text_lower = text.to_lowercase();
        query
            .to_lowercase()
            .split(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
            .filter(|token| token.chars().count() >= 4 && text_lower.contains(token))
            .map(|token| token.chars().count())
            .sum::<usize>()
            + query
                .chars()
                .filter(|c| !c.is_ascii() && text.contains(*c))
                .count()
    }
}

#[async_trait]
impl MemoryService for InMemoryStore {
    async fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<Memory>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| CoreError::Memory("memory store lock poisoned".to_owned()))?;
        let mut scored: Vec<(usize, &Memory)> = entries
            .iter()
            .map(|m| (Self::score(query, &m.text), m))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn store(&self, text: &str) -> Result<Vec<String>> {
        let chunks = self.chunker.split(text);
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CoreError::Memory("memory store lock poisoned".to_owned()))?;
        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let id = format!("mem-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
            entries.push(Memory {
                id: id.clone(),
                text: chunk,
            });
            ids.push(id);
        }
        Ok(ids)
    }
}

/// Backend that remembers nothing; used when memory is disabled.
pub struct NoopMemory;

#[async_trait]
impl MemoryService for NoopMemory {
    async fn retrieve(&self, _query: &str, _limit: usize) -> Result<Vec<Memory>> {
        Ok(Vec::new())
    }

    async fn store(&self, _text: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MemoryConfig {
        MemoryConfig::default()
    }

    // ── Chunking ──────────────────────────────────────────────

    #[test]
    fn short_text_is_one_chunk() {
        let chunker = TextChunker::new(&config());
        assert_eq!(chunker.split("短文本"), vec!["短文本"]);
    }

    #[test]
    fn chunks_respect_size_and_overlap() {
        let chunker = TextChunker::new(&config());
        let text: String = ('a'..='z').cycle().take(250).collect();
        let chunks = chunker.split(&text);
        assert!(chunks.len() >= 3);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 100);
        }
        // Consecutive chunks share the configured 15-char overlap.
        let first: Vec<char> = chunks[0].chars().collect();
        let second: Vec<char> = chunks[1].chars().collect();
        assert_eq!(&first[first.len() - 15..], &second[..15]);
    }

    #[test]
    fn empty_text_has_no_chunks() {
        let chunker = TextChunker::new(&config());
        assert!(chunker.split("").is_empty());
    }

    #[test]
    fn chunking_counts_chars_not_bytes() {
        let chunker = TextChunker::new(&config());
        let text = "字".repeat(150);
        let chunks = chunker.split(&text);
        assert_eq!(chunks[0].chars().count(), 100);
    }

    // ── Store and retrieve ────────────────────────────────────

    #[tokio::test]
    async fn stores_and_retrieves_by_keyword() {
        let store = InMemoryStore::new(&config());
        store.store("the user has two cats named Momo and Taro").await.expect("store");
        store.store("the user dislikes early meetings").await.expect("store");
        let hits = store.retrieve("what about the cats", 3).await.expect("retrieve");
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("cats"));
    }

    #[tokio::test]
    async fn retrieve_matches_cjk_characters() {
        let store = InMemoryStore::new(&config());
        store.store("用户养了两只猫").await.expect("store");
        let hits = store.retrieve("猫怎么样", 3).await.expect("retrieve");
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn retrieve_respects_limit() {
        let store = InMemoryStore::new(&config());
        for i in 0..5 {
            store.store(&format!("note {i} about coffee")).await.expect("store");
        }
        let hits = store.retrieve("coffee", 2).await.expect("retrieve");
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn long_text_stores_multiple_chunks() {
        let store = InMemoryStore::new(&config());
        let ids = store.store(&"字".repeat(250)).await.expect("store");
        assert!(ids.len() >= 3);
    }

    #[tokio::test]
    async fn noop_memory_is_empty() {
        let noop = NoopMemory;
        assert!(noop.retrieve("anything", 3).await.expect("retrieve").is_empty());
        assert!(noop.store("anything").await.expect("store").is_empty());
    }
}
