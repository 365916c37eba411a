use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("Config directory not found")]
    NoConfigDir,

    #[error("Data directory not found")]
    NoDataDir,

    #[error("Library state at {path} is corrupt: {reason}")]
    StoreCorrupt { path: PathBuf, reason: String },

    #[error("Failed to write library state: {0}")]
    StoreWrite(String),

    #[error("Listing source unavailable: {0}")]
    ListingUnavailable(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Another reconciliation pass holds the lock at {0}")]
    AlreadyRunning(PathBuf),

    #[error("Torrent client error: {0}")]
    TorrentClient(String),

    #[error("Download of {release} failed: {reason}")]
    DispatchFailed { release: String, reason: String },

    #[error("Series not found: {0}")]
    SeriesNotFound(String),

    #[error("Episode {episode} of {series} not found")]
    EpisodeNotFound { series: String, episode: String },

    #[error("Invalid series: {0}")]
    InvalidSeries(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
