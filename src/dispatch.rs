use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Error;
use crate::library::models::Series;
use crate::library::parser::sanitize_file_name;
use crate::nyaa::RemoteCandidate;
use crate::torrent::Downloader;

/// Why a dispatch did not succeed. Nothing is recorded for a failure; the
/// episode stays a gap and the next pass retries it.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    Timeout,
    Network(String),
    Downloader(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::Network(e) => write!(f, "network: {}", e),
            FailureReason::Downloader(e) => write!(f, "downloader: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Where the episode file will be
    Success(PathBuf),
    Failure(FailureReason),
}

impl From<Error> for FailureReason {
    fn from(error: Error) -> Self {
        match error {
            Error::Network(e) if e.is_timeout() => FailureReason::Timeout,
            Error::Network(e) => FailureReason::Network(e.to_string()),
            other => FailureReason::Downloader(other.to_string()),
        }
    }
}

/// Hands accepted candidates to a downloader, one at a time
pub struct Dispatcher<D> {
    downloader: D,
    base_dir: PathBuf,
    timeout: Duration,
}

impl<D: Downloader> Dispatcher<D> {
    pub fn new(downloader: D, base_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            downloader,
            base_dir,
            timeout,
        }
    }

    #[cfg(test)]
    pub fn downloader(&self) -> &D {
        &self.downloader
    }

    /// Per-series directory under the base directory
    pub fn destination_for(&self, series: &Series) -> PathBuf {
        self.base_dir.join(sanitize_file_name(&series.title))
    }

    pub async fn dispatch(&self, candidate: &RemoteCandidate, destination_dir: &Path) -> Outcome {
        debug!(
            title = %candidate.title,
            destination = %destination_dir.display(),
            "Dispatching release"
        );

        let fetch = self.downloader.fetch(&candidate.locator, destination_dir);
        let receipt = match tokio::time::timeout(self.timeout, fetch).await {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(e)) => {
                warn!(title = %candidate.title, error = %e, "Dispatch failed");
                return Outcome::Failure(e.into());
            }
            Err(_) => {
                warn!(title = %candidate.title, timeout = ?self.timeout, "Dispatch timed out");
                return Outcome::Failure(FailureReason::Timeout);
            }
        };

        let path = receipt
            .location
            .unwrap_or_else(|| destination_dir.join(sanitize_file_name(&candidate.title)));
        debug!(id = %receipt.id, path = %path.display(), "Release dispatched");
        Outcome::Success(path)
    }
}
