use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::parser::{ParsedRelease, parse_episode_file};
use crate::error::Result;

/// A video file on disk whose name parsed as a release
#[derive(Debug, Clone, PartialEq)]
pub struct LocalEpisode {
    pub path: PathBuf,
    pub release: ParsedRelease,
    /// Found under the stalled directory
    pub stalled: bool,
}

/// Collect parseable video files from a directory (non-recursive)
fn collect_episodes_from_dir(path: &Path, stalled: bool, extensions: &[String]) -> Vec<LocalEpisode> {
    let Ok(entries) = fs::read_dir(path) else {
        return Vec::new();
    };

    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .filter_map(|e| {
            let filename = e.file_name().to_string_lossy().to_string();
            match parse_episode_file(&filename, extensions) {
                Some(release) => Some(LocalEpisode {
                    path: e.path(),
                    release,
                    stalled,
                }),
                None => {
                    debug!(filename = %filename, "Skipping file without a recognizable release name");
                    None
                }
            }
        })
        .collect()
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|n| n.to_string_lossy().starts_with('.'))
}

/// Scan the base directory (loose files plus one level of series folders) and
/// the stalled directory. Results are sorted by path so merges are stable.
pub fn scan_library_dirs(
    base_dir: &Path,
    stalled_dir: &Path,
    extensions: &[String],
) -> Result<Vec<LocalEpisode>> {
    let mut found = Vec::new();

    if !base_dir.exists() {
        debug!(path = %base_dir.display(), "Base directory does not exist, skipping scan");
        return Ok(found);
    }

    found.extend(collect_episodes_from_dir(base_dir, false, extensions));

    for entry in fs::read_dir(base_dir)?.filter_map(|e| e.ok()) {
        let entry_path = entry.path();
        if !entry_path.is_dir() || is_hidden(&entry_path) || entry_path == stalled_dir {
            continue;
        }
        let episodes = collect_episodes_from_dir(&entry_path, false, extensions);
        if !episodes.is_empty() {
            debug!(folder = %entry_path.display(), count = episodes.len(), "Found series folder");
        }
        found.extend(episodes);
    }

    found.extend(collect_episodes_from_dir(stalled_dir, true, extensions));

    found.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(count = found.len(), "Scanned local episodes");
    Ok(found)
}
