use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::Library;
use super::models::EpisodeRecord;
use crate::error::{Error, Result};

/// Durable home of the [`Library`]: one TOML file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct LibraryStore {
    path: PathBuf,
}

impl LibraryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the full state. A missing file is an empty library; anything
    /// unreadable is [`Error::StoreCorrupt`].
    pub fn load(&self) -> Result<Library> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No library state yet, starting empty");
            return Ok(Library::default());
        }

        let content = std::fs::read_to_string(&self.path).map_err(|e| self.corrupt(e))?;
        let mut library: Library = toml::from_str(&content).map_err(|e| self.corrupt(e))?;
        self.validate(&library)?;
        // Hand-edited files may list episodes in any order; upsert relies on it
        for series in &mut library.series {
            series.episodes.sort_by_key(|e| e.number);
        }

        debug!(series = library.series.len(), "Loaded library state");
        Ok(library)
    }

    /// Replace the persisted state. The new content is written to a temp file in
    /// the same directory and renamed over the old one, so readers see either
    /// the previous or the new file.
    pub fn save(&self, library: &Library) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let content =
            toml::to_string_pretty(library).map_err(|e| Error::StoreWrite(e.to_string()))?;

        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| Error::StoreWrite(e.error.to_string()))?;

        info!(path = %self.path.display(), series = library.series.len(), "Saved library state");
        Ok(())
    }

    /// Standalone insert-or-update of one episode: load, upsert, save.
    /// Callers must hold the run lock.
    #[allow(dead_code)]
    pub fn upsert_episode(&self, series_id: &str, episode: EpisodeRecord) -> Result<bool> {
        let mut library = self.load()?;
        let changed = library.upsert_episode(series_id, episode)?;
        if changed {
            self.save(&library)?;
        }
        Ok(changed)
    }

    fn validate(&self, library: &Library) -> Result<()> {
        let mut ids = HashSet::new();
        for series in &library.series {
            if !ids.insert(series.id.as_str()) {
                return Err(self.corrupt(format!("duplicate series id {}", series.id)));
            }
            if series.aliases.is_empty() {
                return Err(self.corrupt(format!("series {} has no aliases", series.id)));
            }
            let mut numbers = HashSet::new();
            for episode in &series.episodes {
                if !numbers.insert(episode.number) {
                    return Err(self.corrupt(format!(
                        "series {} has episode {} twice",
                        series.id, episode.number
                    )));
                }
            }
        }
        Ok(())
    }

    fn corrupt(&self, reason: impl ToString) -> Error {
        Error::StoreCorrupt {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}
