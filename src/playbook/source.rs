//! Where playbook scripts come from.
//!
//! The teacher resolves dynamic inventory through an `InventorySource`
//! trait with one pluggable implementation per backend
//! (`inventory/plugin.rs`); the same shape fits playbook loading here,
//! narrowed to a single implementation that reads a fixed directory.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Abstracts where playbook and helper script bytes come from, so the
/// inliner (`playbook::assemble`) never touches the filesystem directly.
pub trait PlaybookSource: Send + Sync {
    /// Raw bytes of the named playbook's entry script.
    fn read_playbook(&self, name: &str) -> Result<Vec<u8>>;

    /// Raw bytes of a named include (only `"helpers.sh"` is ever valid
    /// per spec.md §4.2; anything else is `UnknownInclude`).
    fn read_include(&self, name: &str) -> Result<Vec<u8>>;

    /// Whether the named playbook exists, without reading it.
    fn playbook_exists(&self, name: &str) -> bool;
}

/// Loads playbooks from a directory on disk: `<root>/<name>.sh` for
/// playbooks, `<root>/helpers.sh` for the shared helper file.
pub struct DirPlaybookSource {
    root: PathBuf,
}

impl DirPlaybookSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn playbook_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.sh"))
    }
}

impl PlaybookSource for DirPlaybookSource {
    fn read_playbook(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.playbook_path(name);
        std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::UnknownPlaybook(name.to_string())
            } else {
                Error::io(path, e)
            }
        })
    }

    fn read_include(&self, name: &str) -> Result<Vec<u8>> {
        if name != "helpers.sh" {
            return Err(Error::UnknownInclude {
                playbook: String::new(),
                include: name.to_string(),
            });
        }
        let path = self.root.join(name);
        std::fs::read(&path).map_err(|e| Error::io(path, e))
    }

    fn playbook_exists(&self, name: &str) -> bool {
        self.playbook_path(name).exists()
    }
}

/// An in-memory source, used in tests so the inliner can be exercised
/// without touching the filesystem.
#[derive(Default)]
pub struct MapPlaybookSource {
    pub playbooks: std::collections::HashMap<String, Vec<u8>>,
    pub includes: std::collections::HashMap<String, Vec<u8>>,
}

impl MapPlaybookSource {
    pub fn with_playbook(mut self, name: &str, content: &str) -> Self {
        self.playbooks.insert(name.to_string(), content.into());
        self
    }

    pub fn with_helpers(mut self, content: &str) -> Self {
        self.includes
            .insert("helpers.sh".to_string(), content.into());
        self
    }
}

impl PlaybookSource for MapPlaybookSource {
    fn read_playbook(&self, name: &str) -> Result<Vec<u8>> {
        self.playbooks
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownPlaybook(name.to_string()))
    }

    fn read_include(&self, name: &str) -> Result<Vec<u8>> {
        self.includes.get(name).cloned().ok_or_else(|| Error::UnknownInclude {
            playbook: String::new(),
            include: name.to_string(),
        })
    }

    fn playbook_exists(&self, name: &str) -> bool {
        self.playbooks.contains_key(name)
    }
}
