use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::debug;

use super::{Downloader, FetchReceipt, magnet_hash};
use crate::error::{Error, Result};
use crate::library::parser::{is_video_file, sanitize_file_name};

/// Drops torrent files into a directory watched by an external client
/// (rtorrent style). The client saves payloads under `download_root`.
pub struct WatchDirDownloader {
    client: reqwest::Client,
    watch_dir: PathBuf,
    download_root: PathBuf,
    video_extensions: Vec<String>,
}

#[derive(Deserialize)]
struct TorrentMeta {
    info: TorrentInfo,
}

#[derive(Deserialize)]
struct TorrentInfo {
    name: String,
    #[serde(default)]
    length: Option<i64>,
    #[serde(default)]
    files: Option<Vec<TorrentFile>>,
}

#[derive(Deserialize)]
struct TorrentFile {
    path: Vec<String>,
    length: i64,
}

/// Relative path of the episode file inside a .torrent: the single file, or
/// the largest video file of a multi-file torrent
pub fn torrent_video_name(bytes: &[u8], extensions: &[String]) -> Result<PathBuf> {
    let meta: TorrentMeta = serde_bencode::from_bytes(bytes)
        .map_err(|e| Error::TorrentClient(format!("Failed to parse torrent: {}", e)))?;
    let info = meta.info;

    let Some(files) = info.files else {
        debug!(name = %info.name, length = ?info.length, "Single-file torrent");
        return Ok(PathBuf::from(info.name));
    };

    files
        .into_iter()
        .filter(|f| {
            f.path
                .last()
                .is_some_and(|name| is_video_file(name, extensions))
        })
        .max_by_key(|f| f.length)
        .map(|f| {
            let mut path = PathBuf::from(&info.name);
            path.extend(&f.path);
            path
        })
        .ok_or_else(|| Error::TorrentClient(format!("No video file in torrent {}", info.name)))
}

impl WatchDirDownloader {
    pub fn new(
        watch_dir: PathBuf,
        download_root: PathBuf,
        video_extensions: Vec<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            watch_dir,
            download_root,
            video_extensions,
        })
    }

    fn write_atomic(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.watch_dir)?;
        let path = self.watch_dir.join(sanitize_file_name(name));

        // The watching client must never see a half-written file
        let mut tmp = NamedTempFile::new_in(&self.watch_dir)?;
        tmp.write_all(content)?;
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
        Ok(path)
    }

    async fn download_torrent(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::TorrentClient(format!(
                "Torrent download failed: {}",
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }

    fn drop_torrent(&self, name: &str, bytes: &[u8]) -> Result<FetchReceipt> {
        let video = torrent_video_name(bytes, &self.video_extensions)?;
        let written = self.write_atomic(name, bytes)?;
        debug!(path = %written.display(), video = %video.display(), "Queued torrent in watch dir");
        Ok(FetchReceipt {
            id: written.display().to_string(),
            location: Some(self.download_root.join(video)),
        })
    }
}

fn torrent_file_name(locator: &str) -> String {
    let last = locator
        .split(['?', '#'])
        .next()
        .and_then(|s| s.rsplit(['/', '\\']).next())
        .filter(|s| !s.is_empty())
        .unwrap_or("release");
    if last.ends_with(".torrent") {
        last.to_string()
    } else {
        format!("{}.torrent", last)
    }
}

impl Downloader for WatchDirDownloader {
    async fn fetch(&self, locator: &str, destination: &Path) -> Result<FetchReceipt> {
        // The watching client picks the payload directory itself
        debug!(destination = %destination.display(), "Watch dir ignores per-series destination");

        if locator.starts_with("magnet:") {
            let hash = magnet_hash(locator)
                .ok_or_else(|| Error::TorrentClient("Magnet link without info hash".to_string()))?;
            let written = self.write_atomic(&format!("{}.magnet", hash), locator.as_bytes())?;
            return Ok(FetchReceipt {
                id: written.display().to_string(),
                location: None,
            });
        }

        if locator.starts_with("http://") || locator.starts_with("https://") {
            let bytes = self.download_torrent(locator).await?;
            return self.drop_torrent(&torrent_file_name(locator), &bytes);
        }

        let bytes = tokio::fs::read(locator).await?;
        self.drop_torrent(&torrent_file_name(locator), &bytes)
    }
}
