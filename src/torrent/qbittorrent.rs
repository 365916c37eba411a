use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use super::{Downloader, FetchReceipt, magnet_hash};
use crate::error::{Error, Result};

/// qBittorrent WebUI API client
#[derive(Clone)]
pub struct QBittorrentClient {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<(String, String)>,
    logged_in: Arc<Mutex<bool>>,
}

impl QBittorrentClient {
    pub fn new(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().cookie_store(true).build()?;

        Ok(Self {
            client,
            base_url: format!("http://{}:{}", host, port),
            credentials: username
                .zip(password)
                .map(|(u, p)| (u.to_string(), p.to_string())),
            logged_in: Arc::new(Mutex::new(false)),
        })
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let url = format!("{}/api/v2/auth/login", self.base_url);

        let response = self
            .client
            .post(&url)
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::TorrentClient(
                "qBittorrent login failed".to_string(),
            ));
        }

        let text = response.text().await?;
        if text != "Ok." {
            return Err(Error::TorrentClient(format!(
                "qBittorrent login failed: {}",
                text
            )));
        }

        debug!("Logged in to qBittorrent");
        Ok(())
    }

    /// Log in once per process; the session cookie is kept by the client
    async fn ensure_login(&self) -> Result<()> {
        let Some((user, pass)) = &self.credentials else {
            return Ok(());
        };
        let mut logged_in = self.logged_in.lock().await;
        if !*logged_in {
            self.login(user, pass).await?;
            *logged_in = true;
        }
        Ok(())
    }
}

impl Downloader for QBittorrentClient {
    async fn fetch(&self, locator: &str, destination: &Path) -> Result<FetchReceipt> {
        self.ensure_login().await?;

        let url = format!("{}/api/v2/torrents/add", self.base_url);
        let savepath = destination.to_string_lossy().to_string();

        let response = self
            .client
            .post(&url)
            .form(&[("urls", locator), ("savepath", savepath.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::TorrentClient(format!(
                "qBittorrent add failed: {}",
                response.status()
            )));
        }

        let text = response.text().await?;
        if text.trim() == "Fails." {
            return Err(Error::TorrentClient(
                "qBittorrent rejected the torrent".to_string(),
            ));
        }

        // The API does not return the hash; magnets carry it
        let hash = magnet_hash(locator).unwrap_or_default();

        debug!(hash = %hash, dir = %savepath, "Added torrent to qBittorrent");
        Ok(FetchReceipt {
            id: hash,
            location: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_need_both_parts() {
        let client = QBittorrentClient::new("localhost", 8080, Some("admin"), None).unwrap();
        assert!(client.credentials.is_none());

        let client =
            QBittorrentClient::new("localhost", 8080, Some("admin"), Some("secret")).unwrap();
        assert_eq!(
            client.credentials,
            Some(("admin".to_string(), "secret".to_string()))
        );
        assert_eq!(client.base_url, "http://localhost:8080");
    }
}
