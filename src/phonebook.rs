//! Phonebook lookup with hot reload
//!
//! Maps caller phone numbers to {name, role}. The backing JSON file is
//! watched and reloaded in place, so adding a teammate does not require a
//! restart.

use anyhow::{Context, Result};
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Caller role from the phonebook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerRole {
    Customer,
    Teammate,
}

/// One phonebook entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhonebookEntry {
    pub name: String,
    pub role: CallerRole,
}

/// In-memory phonebook, cheap to clone and share
#[derive(Clone)]
pub struct Phonebook {
    path: PathBuf,
    entries: Arc<RwLock<HashMap<String, PhonebookEntry>>>,
}

impl Phonebook {
    /// Load the phonebook file; a missing file yields an empty book
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = Self::read_file(&path)?;
        info!("Phonebook loaded: {} entries", entries.len());
        Ok(Self {
            path,
            entries: Arc::new(RwLock::new(entries)),
        })
    }

    fn read_file(path: &Path) -> Result<HashMap<String, PhonebookEntry>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read phonebook {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse phonebook {}", path.display()))
    }

    /// Look up a caller by phone number (exact match after trimming)
    pub fn lookup(&self, phone: &str) -> Option<PhonebookEntry> {
        let book = self.entries.read().ok()?;
        book.get(phone.trim()).cloned()
    }

    /// Number of loaded entries
    pub fn len(&self) -> usize {
        self.entries.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-read the file in place. Parse failures keep the old entries.
    pub fn reload(&self) {
        match Self::read_file(&self.path) {
            Ok(entries) => {
                let count = entries.len();
                if let Ok(mut book) = self.entries.write() {
                    *book = entries;
                }
                info!("Phonebook reloaded: {} entries", count);
            }
            Err(e) => warn!("Phonebook reload failed, keeping previous entries: {}", e),
        }
    }

    /// Watch the backing file and reload on change. The returned watcher
    /// must be kept alive for the watch to stay active.
    pub fn watch(&self) -> Result<notify::RecommendedWatcher> {
        let book = self.clone();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            match event {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    book.reload();
                }
                Ok(_) => {}
                Err(e) => warn!("Phonebook watch error: {}", e),
            }
        })?;

        if let Some(dir) = self.path.parent() {
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("Failed to watch {}", dir.display()))?;
        }
        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_yields_empty_book() {
        let book = Phonebook::load("/nonexistent/phonebook.json").unwrap();
        assert!(book.is_empty());
        assert!(book.lookup("+15550001111").is_none());
    }

    #[test]
    fn test_lookup_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("phonebook.json");

        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            r#"{{"+15550001111": {{"name": "Asha", "role": "teammate"}}}}"#
        )
        .unwrap();

        let book = Phonebook::load(&path).unwrap();
        let entry = book.lookup("+15550001111").unwrap();
        assert_eq!(entry.name, "Asha");
        assert_eq!(entry.role, CallerRole::Teammate);
        assert!(book.lookup(" +15550001111 ").is_some());

        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            r#"{{"+15550002222": {{"name": "Ben", "role": "customer"}}}}"#
        )
        .unwrap();
        book.reload();

        assert!(book.lookup("+15550001111").is_none());
        assert_eq!(book.lookup("+15550002222").unwrap().role, CallerRole::Customer);
    }

    #[test]
    fn test_reload_keeps_entries_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("phonebook.json");

        std::fs::write(
            &path,
            r#"{"+15550001111": {"name": "Asha", "role": "teammate"}}"#,
        )
        .unwrap();
        let book = Phonebook::load(&path).unwrap();
        assert_eq!(book.len(), 1);

        std::fs::write(&path, "{not json").unwrap();
        book.reload();
        assert_eq!(book.len(), 1);
    }
}
