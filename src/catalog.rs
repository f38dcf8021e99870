//! Read-only content catalog.
//!
//! The catalog is injected into the verification flow; the gate only reads
//! `age_rating` to pick the required age. Items rated 0 need no verification.

use std::path::Path;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub title: String,
    /// Minimum viewer age; 0 means unrestricted.
    #[serde(alias = "ageLimit", alias = "age_limit", alias = "min_age")]
    pub age_rating: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

impl ContentItem {
    pub fn requires_verification(&self) -> bool {
        self.age_rating > 0
    }
}

#[derive(Clone, Debug, Default)]
pub struct Catalog {
    items: Vec<ContentItem>,
}

impl Catalog {
    pub fn new(items: Vec<ContentItem>) -> Result<Self> {
        for (i, item) in items.iter().enumerate() {
            if item.id.trim().is_empty() {
                return Err(anyhow!("catalog item {} has an empty id", i));
            }
            if items[..i].iter().any(|other| other.id == item.id) {
                return Err(anyhow!("duplicate catalog id '{}'", item.id));
            }
        }
        Ok(Self { items })
    }

    /// Load a JSON array of items.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read catalog {}: {}", path.display(), e))?;
        Self::from_json_str(&raw)
            .map_err(|e| anyhow!("invalid catalog {}: {}", path.display(), e))
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let items: Vec<ContentItem> = serde_json::from_str(raw)?;
        Self::new(items)
    }

    /// Small built-in catalog used when none is configured.
    pub fn demo() -> Self {
        let item = |id: &str, title: &str, age_rating: u32, genre: &str, duration: &str| {
            ContentItem {
                id: id.to_string(),
                title: title.to_string(),
                age_rating,
                genre: Some(genre.to_string()),
                duration: Some(duration.to_string()),
            }
        };
        Self {
            items: vec![
                item("1", "Dark Horizons", 18, "Thriller", "2h 14m"),
                item("2", "Starlight Academy", 13, "Adventure", "1h 48m"),
                item("3", "Midnight Protocol", 16, "Action", "2h 02m"),
                item("4", "The Silent Ward", 18, "Horror", "1h 55m"),
                item("5", "Paper Kites", 0, "Family", "1h 32m"),
            ],
        }
    }

    pub fn get(&self, id: &str) -> Option<&ContentItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn items(&self) -> &[ContentItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
