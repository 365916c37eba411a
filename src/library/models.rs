use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::parser::{make_series_id, normalize_alias};
use crate::error::{Error, Result};

/// Episode number stored in hundredths so specials like `12.5` order and hash exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct EpisodeNumber(u32);

const HUNDREDTHS: u32 = 100;

impl EpisodeNumber {
    pub fn new(whole: u32) -> Self {
        Self(whole * HUNDREDTHS)
    }

    pub fn is_special(&self) -> bool {
        self.0 % HUNDREDTHS != 0
    }

    pub fn as_f64(&self) -> f64 {
        f64::from(self.0) / f64::from(HUNDREDTHS)
    }
}

impl TryFrom<f64> for EpisodeNumber {
    type Error = String;

    fn try_from(value: f64) -> std::result::Result<Self, Self::Error> {
        if !value.is_finite() || value < 0.0 || value > f64::from(u32::MAX / HUNDREDTHS) {
            return Err(format!("invalid episode number: {}", value));
        }
        Ok(Self((value * f64::from(HUNDREDTHS)).round() as u32))
    }
}

impl From<EpisodeNumber> for f64 {
    fn from(value: EpisodeNumber) -> Self {
        value.as_f64()
    }
}

impl FromStr for EpisodeNumber {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let value: f64 = s
            .trim()
            .parse()
            .map_err(|_| format!("invalid episode number: {}", s))?;
        Self::try_from(value)
    }
}

impl fmt::Display for EpisodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / HUNDREDTHS;
        let frac = self.0 % HUNDREDTHS;
        if frac == 0 {
            write!(f, "{:02}", whole)
        } else if frac % 10 == 0 {
            write!(f, "{:02}.{}", whole, frac / 10)
        } else {
            write!(f, "{:02}.{:02}", whole, frac)
        }
    }
}

/// Per-episode viewing state. `Manual` episodes are kept out of any auto-play queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WatchStatus {
    #[default]
    Unwatched,
    Watched,
    Stalled,
    Manual,
}

impl WatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchStatus::Unwatched => "unwatched",
            WatchStatus::Watched => "watched",
            WatchStatus::Stalled => "stalled",
            WatchStatus::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SeriesStatus {
    /// Reconciled on every pass
    #[default]
    Watching,
    /// Finished; kept for history, never queried
    Watched,
    /// Paused by the user; kept, never queried
    Stalled,
}

impl SeriesStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeriesStatus::Watching => "watching",
            SeriesStatus::Watched => "watched",
            SeriesStatus::Stalled => "stalled",
        }
    }
}

/// Where a present episode came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub group: String,
    pub release: String,
    #[serde(default)]
    pub resolution: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub number: EpisodeNumber,
    #[serde(default)]
    pub present: bool,
    #[serde(default)]
    pub status: WatchStatus,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub provenance: Option<Provenance>,
}

impl EpisodeRecord {
    pub fn present(number: EpisodeNumber, path: PathBuf, provenance: Provenance) -> Self {
        Self {
            number,
            present: true,
            status: WatchStatus::Unwatched,
            path: Some(path),
            provenance: Some(provenance),
        }
    }

    pub fn file_name(&self) -> Option<String> {
        self.path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub id: String,
    pub title: String,
    pub aliases: Vec<String>,
    #[serde(default)]
    pub status: SeriesStatus,
    /// Listing query used instead of the title (config `[queries]` still wins)
    #[serde(default)]
    pub query: Option<String>,
    /// Candidates below this episode are never fetched
    #[serde(default)]
    pub min_episode: Option<EpisodeNumber>,
    #[serde(default)]
    pub episodes: Vec<EpisodeRecord>,
}

impl Series {
    /// Build a series from a display title. The title is always one of its aliases.
    pub fn new(title: &str, aliases: &[String]) -> Result<Self> {
        let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
        let id = make_series_id(&title);
        if id.is_empty() {
            return Err(Error::InvalidSeries(format!(
                "title {:?} has no usable characters",
                title
            )));
        }

        let mut series = Self {
            id,
            title: title.clone(),
            aliases: Vec::new(),
            status: SeriesStatus::default(),
            query: None,
            min_episode: None,
            episodes: Vec::new(),
        };
        series.add_alias(&title);
        for alias in aliases {
            series.add_alias(alias);
        }
        Ok(series)
    }

    /// Add a normalized alias; blank and duplicate aliases are ignored
    pub fn add_alias(&mut self, alias: &str) -> bool {
        let alias = normalize_alias(alias);
        if alias.is_empty() || self.aliases.contains(&alias) {
            return false;
        }
        self.aliases.push(alias);
        true
    }

    pub fn get_episode(&self, number: EpisodeNumber) -> Option<&EpisodeRecord> {
        self.episodes.iter().find(|e| e.number == number)
    }

    pub fn get_episode_mut(&mut self, number: EpisodeNumber) -> Option<&mut EpisodeRecord> {
        self.episodes.iter_mut().find(|e| e.number == number)
    }

    /// Insert or replace the record for `episode.number`, keeping episodes ordered.
    /// Returns true when the stored state changed.
    pub fn upsert_episode(&mut self, episode: EpisodeRecord) -> bool {
        match self
            .episodes
            .binary_search_by(|e| e.number.cmp(&episode.number))
        {
            Ok(idx) => {
                if self.episodes[idx] == episode {
                    return false;
                }
                self.episodes[idx] = episode;
                true
            }
            Err(idx) => {
                self.episodes.insert(idx, episode);
                true
            }
        }
    }

    pub fn present_numbers(&self) -> BTreeSet<EpisodeNumber> {
        self.episodes
            .iter()
            .filter(|e| e.present)
            .map(|e| e.number)
            .collect()
    }

    /// Highest episode confirmed present locally
    pub fn latest_present(&self) -> Option<EpisodeNumber> {
        self.episodes
            .iter()
            .filter(|e| e.present)
            .map(|e| e.number)
            .max()
    }

    pub fn latest_watched(&self) -> Option<EpisodeNumber> {
        self.episodes
            .iter()
            .filter(|e| e.status == WatchStatus::Watched)
            .map(|e| e.number)
            .max()
    }

    /// When an episode was last recorded, from provenance
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.episodes
            .iter()
            .filter_map(|e| e.provenance.as_ref())
            .map(|p| p.recorded_at)
            .max()
    }

    pub fn is_reconciled(&self) -> bool {
        self.status == SeriesStatus::Watching
    }

    /// Most recent release group seen in provenance, for display and filtering
    pub fn latest_group(&self) -> Option<&str> {
        self.episodes
            .iter()
            .rev()
            .find_map(|e| e.provenance.as_ref())
            .map(|p| p.group.as_str())
    }
}
