use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::debug;

use super::{Downloader, FetchReceipt};
use crate::error::{Error, Result};

/// Transmission RPC client
#[derive(Clone)]
pub struct TransmissionClient {
    client: reqwest::Client,
    url: String,
    session_id: Arc<RwLock<Option<String>>>,
}

impl TransmissionClient {
    pub fn new(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder();

        if let (Some(user), Some(pass)) = (username, password) {
            let auth =
                base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
            let value = reqwest::header::HeaderValue::from_str(&format!("Basic {}", auth))
                .map_err(|e| Error::TorrentClient(format!("Invalid Transmission credentials: {}", e)))?;

            let mut headers = reqwest::header::HeaderMap::new();
            headers.insert(reqwest::header::AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }

        Ok(Self {
            client: builder.build()?,
            url: format!("http://{}:{}/transmission/rpc", host, port),
            session_id: Arc::new(RwLock::new(None)),
        })
    }

    async fn rpc_call(&self, method: &str, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let body = json!({
            "method": method,
            "arguments": arguments
        });

        let mut request = self.client.post(&self.url).json(&body);

        if let Some(session_id) = self.session_id.read().await.as_ref() {
            request = request.header("X-Transmission-Session-Id", session_id);
        }

        let mut response = request.send().await?;

        // 409 Conflict carries a fresh session id; retry once with it
        if response.status() == reqwest::StatusCode::CONFLICT {
            if let Some(new_session_id) = response.headers().get("X-Transmission-Session-Id") {
                let session_id_str = new_session_id.to_str().unwrap_or("").to_string();
                debug!(session_id = %session_id_str, "Updated Transmission session ID");
                *self.session_id.write().await = Some(session_id_str.clone());

                response = self
                    .client
                    .post(&self.url)
                    .header("X-Transmission-Session-Id", session_id_str)
                    .json(&body)
                    .send()
                    .await?;
            }
        }

        if !response.status().is_success() {
            return Err(Error::TorrentClient(format!(
                "Transmission RPC error: {}",
                response.status()
            )));
        }

        let result: TransmissionResponse = response.json().await?;
        if result.result != "success" {
            return Err(Error::TorrentClient(format!(
                "Transmission {} failed: {}",
                method, result.result
            )));
        }
        Ok(result.arguments)
    }
}

#[derive(Deserialize)]
struct TransmissionResponse {
    result: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

/// Hash and top-level name of an added (or already known) torrent
fn added_torrent(arguments: &serde_json::Value) -> (String, Option<String>) {
    let torrent = arguments
        .get("torrent-added")
        .or_else(|| arguments.get("torrent-duplicate"));

    let hash = torrent
        .and_then(|t| t.get("hashString"))
        .and_then(|h| h.as_str())
        .unwrap_or("")
        .to_string();
    let name = torrent
        .and_then(|t| t.get("name"))
        .and_then(|n| n.as_str())
        .map(str::to_string);
    (hash, name)
}

impl Downloader for TransmissionClient {
    async fn fetch(&self, locator: &str, destination: &Path) -> Result<FetchReceipt> {
        let args = json!({
            "filename": locator,
            "download-dir": destination.to_string_lossy(),
        });

        let result = self.rpc_call("torrent-add", args).await?;
        let (hash, name) = added_torrent(&result);

        debug!(hash = %hash, dir = %destination.display(), "Added torrent to Transmission");
        Ok(FetchReceipt {
            id: hash,
            location: name.map(|n| destination.join(n)),
        })
    }
}
