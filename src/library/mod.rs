pub mod models;
pub mod parser;
pub mod scanner;
pub mod store;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use models::{EpisodeNumber, EpisodeRecord, Provenance, Series, SeriesStatus, WatchStatus};
pub use scanner::{LocalEpisode, scan_library_dirs};
pub use store::LibraryStore;

use crate::error::{Error, Result};
use crate::matcher::title_matches;
use parser::{make_series_id, normalize_alias};

/// Persisted library state
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Library {
    #[serde(default)]
    pub series: Vec<Series>,
}

/// What a local scan changed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeSummary {
    pub new_series: usize,
    pub new_episodes: usize,
    pub relocated: usize,
}

/// Criteria for `list`; every set field must hold
#[derive(Debug, Default, Clone)]
pub struct LibraryFilter {
    pub series: Option<String>,
    pub status: Option<WatchStatus>,
    pub search: Option<String>,
    pub group: Option<String>,
    pub min_episode: Option<EpisodeNumber>,
    pub max_episode: Option<EpisodeNumber>,
    /// Last activity at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Last activity at or before this instant
    pub before: Option<DateTime<Utc>>,
}

impl Library {
    pub fn get_series(&self, id: &str) -> Option<&Series> {
        self.series.iter().find(|s| s.id == id)
    }

    pub fn get_series_mut(&mut self, id: &str) -> Option<&mut Series> {
        self.series.iter_mut().find(|s| s.id == id)
    }

    /// Series whose id or one of whose aliases equals the (normalized) title
    fn position_by_title(&self, title: &str) -> Option<usize> {
        let alias = normalize_alias(title);
        let id = make_series_id(title);
        self.series
            .iter()
            .position(|s| s.aliases.contains(&alias))
            .or_else(|| self.series.iter().position(|s| s.id == id))
    }

    /// Series a scanned file belongs to: the one already recording that path,
    /// else an exact alias or id hit, else any series whose aliases match the
    /// way the release matcher matches them.
    fn position_for_local(&self, local: &LocalEpisode) -> Option<usize> {
        let path = local.path.as_path();
        self.series
            .iter()
            .position(|s| s.episodes.iter().any(|e| e.path.as_deref() == Some(path)))
            .or_else(|| self.position_by_title(&local.release.title))
            .or_else(|| {
                self.series
                    .iter()
                    .position(|s| title_matches(&s.aliases, &local.release.title))
            })
    }

    fn sort(&mut self) {
        self.series
            .sort_by(|a, b| a.title.to_lowercase().cmp(&b.title.to_lowercase()));
    }

    /// Register a series, or extend an existing one with new aliases and settings
    pub fn track(
        &mut self,
        title: &str,
        aliases: &[String],
        query: Option<String>,
        min_episode: Option<EpisodeNumber>,
    ) -> Result<&Series> {
        let candidate = Series::new(title, aliases)?;
        let id = candidate.id.clone();

        match self.get_series_mut(&id) {
            Some(existing) => {
                for alias in &candidate.aliases {
                    existing.add_alias(alias);
                }
                if query.is_some() {
                    existing.query = query;
                }
                if min_episode.is_some() {
                    existing.min_episode = min_episode;
                }
                existing.status = SeriesStatus::Watching;
                debug!(series = %id, "Updated tracked series");
            }
            None => {
                let mut series = candidate;
                series.query = query;
                series.min_episode = min_episode;
                info!(series = %id, "Tracking new series");
                self.series.push(series);
                self.sort();
            }
        }

        self.get_series(&id)
            .ok_or_else(|| Error::SeriesNotFound(id.clone()))
    }

    /// Explicit removal; the only way a series leaves the library
    pub fn untrack(&mut self, id: &str) -> Result<Series> {
        let idx = self
            .series
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| Error::SeriesNotFound(id.to_string()))?;
        info!(series = %id, "Removing series");
        Ok(self.series.remove(idx))
    }

    pub fn upsert_episode(&mut self, series_id: &str, episode: EpisodeRecord) -> Result<bool> {
        let series = self
            .get_series_mut(series_id)
            .ok_or_else(|| Error::SeriesNotFound(series_id.to_string()))?;
        Ok(series.upsert_episode(episode))
    }

    pub fn mark_episode(
        &mut self,
        series_id: &str,
        number: EpisodeNumber,
        status: WatchStatus,
    ) -> Result<&EpisodeRecord> {
        let series = self
            .get_series_mut(series_id)
            .ok_or_else(|| Error::SeriesNotFound(series_id.to_string()))?;
        let episode = series
            .get_episode_mut(number)
            .ok_or_else(|| Error::EpisodeNotFound {
                series: series_id.to_string(),
                episode: number.to_string(),
            })?;
        episode.status = status;
        Ok(episode)
    }

    pub fn mark_series(&mut self, series_id: &str, status: SeriesStatus) -> Result<()> {
        let series = self
            .get_series_mut(series_id)
            .ok_or_else(|| Error::SeriesNotFound(series_id.to_string()))?;
        series.status = status;
        Ok(())
    }

    /// Fold scanned files into the library. New files create records (and
    /// series on first sight); known records only gain a fresh path when their
    /// stored one was not seen in this scan. Nothing is ever removed.
    pub fn merge_local(&mut self, found: &[LocalEpisode], now: DateTime<Utc>) -> MergeSummary {
        let mut summary = MergeSummary::default();
        let seen: HashSet<&Path> = found.iter().map(|e| e.path.as_path()).collect();

        for local in found {
            let idx = match self.position_for_local(local) {
                Some(idx) => idx,
                None => match Series::new(&local.release.title, &[]) {
                    Ok(series) => {
                        debug!(series = %series.id, "Discovered series on disk");
                        self.series.push(series);
                        summary.new_series += 1;
                        self.series.len() - 1
                    }
                    Err(e) => {
                        debug!(path = %local.path.display(), error = %e, "Skipping file");
                        continue;
                    }
                },
            };
            let series = &mut self.series[idx];

            match series.get_episode_mut(local.release.episode) {
                Some(existing) => {
                    let stale = existing
                        .path
                        .as_deref()
                        .is_none_or(|p| !seen.contains(p));
                    if stale && existing.path.as_deref() != Some(local.path.as_path()) {
                        existing.path = Some(local.path.clone());
                        existing.present = true;
                        summary.relocated += 1;
                    }
                }
                None => {
                    series.upsert_episode(EpisodeRecord {
                        number: local.release.episode,
                        present: true,
                        status: if local.stalled {
                            WatchStatus::Stalled
                        } else {
                            WatchStatus::Unwatched
                        },
                        path: Some(local.path.clone()),
                        provenance: Some(Provenance {
                            group: local.release.group_name().to_string(),
                            release: local
                                .path
                                .file_stem()
                                .map(|s| s.to_string_lossy().to_string())
                                .unwrap_or_default(),
                            resolution: local.release.resolution.clone(),
                            recorded_at: now,
                        }),
                    });
                    summary.new_episodes += 1;
                }
            }
        }

        if summary.new_series > 0 {
            self.sort();
        }
        summary
    }

    pub fn filter(&self, filter: &LibraryFilter) -> Vec<&Series> {
        self.series
            .iter()
            .filter(|s| filter.series.as_ref().is_none_or(|id| &s.id == id))
            .filter(|s| {
                filter.search.as_ref().is_none_or(|q| {
                    fuzzy_match(q, &s.title) || s.aliases.iter().any(|a| fuzzy_match(q, a))
                })
            })
            .filter(|s| {
                filter.group.as_ref().is_none_or(|g| {
                    let g = g.to_lowercase();
                    s.episodes
                        .iter()
                        .filter_map(|e| e.provenance.as_ref())
                        .any(|p| p.group.to_lowercase().contains(&g))
                })
            })
            .filter(|s| {
                filter
                    .min_episode
                    .is_none_or(|min| s.latest_present().is_some_and(|latest| latest >= min))
            })
            .filter(|s| {
                filter
                    .max_episode
                    .is_none_or(|max| s.episodes.iter().any(|e| e.number <= max))
            })
            .filter(|s| {
                filter
                    .since
                    .is_none_or(|since| s.last_activity().is_some_and(|at| at >= since))
            })
            .filter(|s| {
                filter
                    .before
                    .is_none_or(|before| s.last_activity().is_some_and(|at| at <= before))
            })
            .filter(|s| match filter.status {
                None => true,
                // Fully watched series only
                Some(WatchStatus::Watched) => {
                    !s.episodes.is_empty()
                        && s.episodes.iter().all(|e| e.status == WatchStatus::Watched)
                }
                Some(status) => s.episodes.iter().any(|e| e.status == status),
            })
            .collect()
    }
}

/// Case-insensitive substring match, or every query word appears in the target
pub fn fuzzy_match(query: &str, target: &str) -> bool {
    let query = query.to_lowercase();
    let target = target.to_lowercase();

    if target.contains(&query) {
        return true;
    }
    let words: Vec<&str> = query.split_whitespace().collect();
    !words.is_empty() && words.iter().all(|w| target.contains(w))
}

/// Move an episode file into the stalled directory, returning its new path.
/// Files already there stay put.
pub fn move_to_stalled(path: &Path, stalled_dir: &Path) -> Result<PathBuf> {
    if path.starts_with(stalled_dir) {
        return Ok(path.to_path_buf());
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::InvalidSeries(format!("not a file path: {}", path.display())))?;

    std::fs::create_dir_all(stalled_dir)?;
    let dest = stalled_dir.join(file_name);
    std::fs::rename(path, &dest)?;
    info!(from = %path.display(), to = %dest.display(), "Moved episode to stalled");
    Ok(dest)
}
