mod qbittorrent;
mod transmission;
mod watch_dir;

pub use qbittorrent::QBittorrentClient;
pub use transmission::TransmissionClient;
pub use watch_dir::WatchDirDownloader;

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{Error, Result};

/// What a downloader reports after accepting a locator
#[derive(Debug, Clone, PartialEq)]
pub struct FetchReceipt {
    /// Downloader-specific handle: torrent hash or the file dropped in the watch dir
    pub id: String,
    /// Where the episode file will land, when the downloader knows
    pub location: Option<PathBuf>,
}

/// A sink that takes a release locator and makes it land under `destination`
pub trait Downloader: Send + Sync {
    fn fetch(
        &self,
        locator: &str,
        destination: &Path,
    ) -> impl std::future::Future<Output = Result<FetchReceipt>> + Send;
}

pub enum AnyDownloader {
    WatchDir(WatchDirDownloader),
    Transmission(TransmissionClient),
    QBittorrent(QBittorrentClient),
}

impl AnyDownloader {
    pub fn from_config(config: &Config) -> Result<Self> {
        let download = &config.download;
        let username = download.username.as_deref();
        let password = download.password.as_deref();

        match download.client.as_str() {
            "watch_dir" => Ok(AnyDownloader::WatchDir(WatchDirDownloader::new(
                config.watch_dir(),
                config.base_dir(),
                config.general.video_extensions.clone(),
            )?)),
            "transmission" => Ok(AnyDownloader::Transmission(TransmissionClient::new(
                &download.host,
                download.port,
                username,
                password,
            )?)),
            "qbittorrent" => Ok(AnyDownloader::QBittorrent(QBittorrentClient::new(
                &download.host,
                download.port,
                username,
                password,
            )?)),
            other => Err(Error::TorrentClient(format!(
                "Unknown download client: {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AnyDownloader::WatchDir(_) => "watch_dir",
            AnyDownloader::Transmission(_) => "transmission",
            AnyDownloader::QBittorrent(_) => "qbittorrent",
        }
    }
}

impl Downloader for AnyDownloader {
    async fn fetch(&self, locator: &str, destination: &Path) -> Result<FetchReceipt> {
        match self {
            AnyDownloader::WatchDir(d) => d.fetch(locator, destination).await,
            AnyDownloader::Transmission(c) => c.fetch(locator, destination).await,
            AnyDownloader::QBittorrent(c) => c.fetch(locator, destination).await,
        }
    }
}

/// Info hash from a magnet link, lowercased
pub fn magnet_hash(magnet: &str) -> Option<String> {
    magnet
        .split("btih:")
        .nth(1)
        .and_then(|s| s.split('&').next())
        .filter(|h| !h.is_empty())
        .map(str::to_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magnet_hash() {
        assert_eq!(
            magnet_hash("magnet:?xt=urn:btih:ABCDEF&dn=Example").as_deref(),
            Some("abcdef")
        );
        assert_eq!(magnet_hash("magnet:?dn=Example"), None);
    }

    #[test]
    fn test_from_config_rejects_unknown_client() {
        let mut config = Config::default();
        config.download.client = "aria2".to_string();
        assert!(matches!(
            AnyDownloader::from_config(&config),
            Err(Error::TorrentClient(_))
        ));

        config.download.client = "transmission".to_string();
        let downloader = AnyDownloader::from_config(&config).unwrap();
        assert_eq!(downloader.name(), "transmission");
    }
}
