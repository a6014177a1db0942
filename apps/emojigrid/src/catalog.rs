//! Read-only emoji catalog.
//!
//! Loaded once from the JSON array the picker ships with:
//!
//! ```json
//! [{ "id": "1", "emoji": "😀", "tags": ["grinning", "face"] }]
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use grid_proto::CatalogId;
use serde::Deserialize;

const STOP_WORDS: &[&str] = &["the", "with", "on", "over", "and", "or", "in"];

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("catalog is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("catalog id {raw:?} is not in 1..=65535")]
    InvalidId { raw: String },
    #[error("catalog id {0} appears more than once")]
    DuplicateId(CatalogId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: CatalogId,
    pub glyph: String,
    pub tags: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u64),
    Text(String),
}

#[derive(Deserialize)]
struct RawEntry {
    id: RawId,
    emoji: String,
    #[serde(default)]
    tags: Vec<String>,
}

impl TryFrom<RawEntry> for CatalogEntry {
    type Error = CatalogError;

    fn try_from(raw: RawEntry) -> Result<Self, Self::Error> {
        let text = match &raw.id {
            RawId::Number(n) => n.to_string(),
            RawId::Text(s) => s.trim().to_string(),
        };
        let id = text
            .parse::<u16>()
            .ok()
            .and_then(CatalogId::new)
            .ok_or(CatalogError::InvalidId { raw: text })?;
        Ok(Self {
            id,
            glyph: raw.emoji,
            tags: raw.tags,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    by_id: HashMap<CatalogId, usize>,
}

impl Catalog {
    pub fn from_entries(entries: Vec<CatalogEntry>) -> Result<Self, CatalogError> {
        let mut by_id = HashMap::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            if by_id.insert(entry.id, index).is_some() {
                return Err(CatalogError::DuplicateId(entry.id));
            }
        }
        Ok(Self { entries, by_id })
    }

    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        let raw: Vec<RawEntry> = serde_json::from_str(json)?;
        let entries = raw
            .into_iter()
            .map(CatalogEntry::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_entries(entries)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.iter()
    }

    pub fn entry(&self, id: CatalogId) -> Option<&CatalogEntry> {
        self.by_id.get(&id).map(|&index| &self.entries[index])
    }

    /// Glyph for `id`.
    pub fn lookup(&self, id: CatalogId) -> Option<&str> {
        self.entry(id).map(|entry| entry.glyph.as_str())
    }

    /// Entries with a tag containing `query` (case-insensitive), in catalog
    /// order. An empty query matches every entry that has a tag.
    pub fn search<'a>(&'a self, query: &str) -> impl Iterator<Item = &'a CatalogEntry> + 'a {
        let needle = query.trim().to_lowercase();
        self.entries.iter().filter(move |entry| {
            entry
                .tags
                .iter()
                .any(|tag| tag.to_lowercase().contains(&needle))
        })
    }

    /// Resolve user input: a numeric id, the glyph itself, or else the first
    /// entry whose tags match.
    pub fn resolve(&self, input: &str) -> Option<&CatalogEntry> {
        let input = input.trim();
        if let Some(entry) = input
            .parse::<u16>()
            .ok()
            .and_then(CatalogId::new)
            .and_then(|id| self.entry(id))
        {
            return Some(entry);
        }
        if let Some(entry) = self.entries.iter().find(|entry| entry.glyph == input) {
            return Some(entry);
        }
        if input.is_empty() {
            return None;
        }
        self.search(input).next()
    }
}

/// Tags for a descriptive emoji name: words split on spaces, reduced to
/// ASCII letters, lowercased, stop words and repeats dropped.
pub fn tags_from_name(name: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for word in name.split(' ') {
        let tag: String = word
            .chars()
            .filter(char::is_ascii_alphabetic)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if tag.is_empty() || STOP_WORDS.contains(&tag.as_str()) || tags.contains(&tag) {
            continue;
        }
        tags.push(tag);
    }
    tags
}
