use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::matcher::{MatchPolicy, TieBreak};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub listing: ListingConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    /// Per-series listing query overrides, keyed by series id
    #[serde(default)]
    pub queries: BTreeMap<String, String>,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub base_dir: PathBuf,
    #[serde(default = "default_stalled_dir_name")]
    pub stalled_dir_name: String,
    #[serde(default = "default_video_extensions")]
    pub video_extensions: Vec<String>,
    /// Defaults to `<base_dir>/.tsuzuki/library.toml`
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    #[serde(default = "default_trusted_groups")]
    pub groups: Vec<String>,
    #[serde(default = "default_tie_break")]
    pub tie_break: Vec<TieBreak>,
    /// Explicit preference among trusted groups. Empty means unconfigured.
    #[serde(default)]
    pub group_priority: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingConfig {
    #[serde(default = "default_listing_url")]
    pub base_url: String,
    #[serde(default = "default_listing_category")]
    pub category: String,
    #[serde(default = "default_listing_filter")]
    pub filter: String,
    #[serde(default = "default_listing_pages")]
    pub pages: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_cache_timeout")]
    pub cache_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl ListingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_download_client")]
    pub client: String,
    /// Defaults to `<base_dir>/.watch/start`
    #[serde(default)]
    pub watch_dir: Option<PathBuf>,
    #[serde(default = "default_torrent_host")]
    pub host: String,
    #[serde(default = "default_torrent_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,
}

fn default_stalled_dir_name() -> String {
    "stalled".to_string()
}

fn default_video_extensions() -> Vec<String> {
    ["mkv", "mp4", "avi", "webm"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_trusted_groups() -> Vec<String> {
    vec!["SubsPlease".to_string(), "Erai-raws".to_string()]
}

fn default_tie_break() -> Vec<TieBreak> {
    vec![TieBreak::GroupPriority, TieBreak::Resolution]
}

fn default_listing_url() -> String {
    "https://nyaa.si".to_string()
}

fn default_listing_category() -> String {
    "1_2".to_string() // Anime - English-translated
}

fn default_listing_filter() -> String {
    "2".to_string() // Trusted uploaders only
}

fn default_listing_pages() -> u32 {
    1
}

fn default_request_timeout() -> u64 {
    30
}

// Shorter than any sensible cron interval, so each pass sees fresh listings
fn default_cache_timeout() -> u64 {
    60 * 60
}

fn default_user_agent() -> String {
    "tsuzuki/0.1".to_string()
}

fn default_download_client() -> String {
    "watch_dir".to_string()
}

fn default_torrent_host() -> String {
    "localhost".to_string()
}

fn default_torrent_port() -> u16 {
    9091 // Transmission default
}

fn default_fetch_timeout() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            trust: TrustConfig::default(),
            listing: ListingConfig::default(),
            download: DownloadConfig::default(),
            queries: BTreeMap::new(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        let base_dir = data_dir()
            .map(|d| d.join("anime"))
            .unwrap_or_else(|_| PathBuf::from("anime"));

        Self {
            base_dir,
            stalled_dir_name: default_stalled_dir_name(),
            video_extensions: default_video_extensions(),
            state_file: None,
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            groups: default_trusted_groups(),
            tie_break: default_tie_break(),
            group_priority: Vec::new(),
        }
    }
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            base_url: default_listing_url(),
            category: default_listing_category(),
            filter: default_listing_filter(),
            pages: default_listing_pages(),
            request_timeout_secs: default_request_timeout(),
            cache_timeout_secs: default_cache_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            client: default_download_client(),
            watch_dir: None,
            host: default_torrent_host(),
            port: default_torrent_port(),
            username: None,
            password: None,
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("", "", "tsuzuki").ok_or(Error::NoConfigDir)
}

pub fn config_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().to_path_buf())
}

pub fn data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

pub fn cache_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.cache_dir().join("listings"))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Load from an explicit path, writing the defaults there if the file is missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Config::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn base_dir(&self) -> PathBuf {
        expand_home(&self.general.base_dir)
    }

    pub fn stalled_dir(&self) -> PathBuf {
        self.base_dir().join(&self.general.stalled_dir_name)
    }

    fn internal_dir(&self) -> PathBuf {
        self.base_dir().join(".tsuzuki")
    }

    pub fn state_path(&self) -> PathBuf {
        match &self.general.state_file {
            Some(path) => expand_home(path),
            None => self.internal_dir().join("library.toml"),
        }
    }

    pub fn lock_path(&self) -> PathBuf {
        self.internal_dir().join("run.lock")
    }

    pub fn watch_dir(&self) -> PathBuf {
        match &self.download.watch_dir {
            Some(path) => expand_home(path),
            None => self.base_dir().join(".watch").join("start"),
        }
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_secs(self.listing.cache_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.download.fetch_timeout_secs)
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy::new(
            &self.trust.groups,
            &self.trust.group_priority,
            self.trust.tie_break.clone(),
        )
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    // Support both ~/. and ~\ for generic home directory expansion
    if path_str.starts_with("~/") || path_str.starts_with("~\\") || path_str == "~" {
        if let Some(home) = dirs_home() {
            if path_str == "~" {
                return home;
            }
            return home.join(&path_str[2..]);
        }
    }
    path.to_path_buf()
}

fn dirs_home() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}
