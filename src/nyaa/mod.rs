use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ListingConfig;
use crate::error::{Error, Result};
use crate::library::models::EpisodeNumber;
use crate::library::parser::{
    UNKNOWN_GROUP, parse_release, parse_release_group, parse_resolution,
};

mod cache;
pub use cache::{ListingCache, normalize_query};

/// One row of a listing page: the raw release title and where to fetch it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingEntry {
    pub title: String,
    pub locator: String,
}

/// Unparsed result of one query. `malformed` counts rows that had no usable
/// title or locator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub entries: Vec<ListingEntry>,
    pub malformed: usize,
}

/// A remote index that can be queried for releases
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Fetch one bounded page set for `query`. Only a total failure to reach
    /// the index is an error.
    async fn fetch(&self, query: &str) -> Result<RawListing>;
}

/// A parsed release, consumed within one reconciliation pass
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCandidate {
    /// Raw release title
    pub title: String,
    pub group: Option<String>,
    /// Series part of the title, when the title parsed
    pub series_title: Option<String>,
    /// `None` for titles without a single episode number (batches, ranges)
    pub episode: Option<EpisodeNumber>,
    pub resolution: Option<String>,
    pub locator: String,
    /// Index in listing order
    pub position: usize,
}

impl RemoteCandidate {
    pub fn from_entry(entry: ListingEntry, position: usize) -> Self {
        match parse_release(&entry.title) {
            Some(parsed) => Self {
                group: parsed.group,
                series_title: Some(parsed.title),
                episode: Some(parsed.episode),
                resolution: parsed.resolution,
                title: entry.title,
                locator: entry.locator,
                position,
            },
            None => Self {
                group: parse_release_group(&entry.title),
                series_title: None,
                episode: None,
                resolution: parse_resolution(&entry.title),
                title: entry.title,
                locator: entry.locator,
                position,
            },
        }
    }

    pub fn group_name(&self) -> &str {
        self.group.as_deref().unwrap_or(UNKNOWN_GROUP)
    }
}

/// Parsed candidates for one query
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub candidates: Vec<RemoteCandidate>,
    /// Rows dropped before parsing; reported as `unparsable`
    pub malformed: usize,
    pub from_cache: bool,
}

impl Listing {
    fn from_raw(raw: RawListing, from_cache: bool) -> Self {
        Self {
            candidates: raw
                .entries
                .into_iter()
                .enumerate()
                .map(|(i, entry)| RemoteCandidate::from_entry(entry, i))
                .collect(),
            malformed: raw.malformed,
            from_cache,
        }
    }
}

/// Listing client: a release source behind the optional response cache
pub struct ListingClient<S> {
    source: S,
    cache: Option<ListingCache>,
}

impl<S: ReleaseSource> ListingClient<S> {
    pub fn new(source: S, cache: Option<ListingCache>) -> Self {
        Self { source, cache }
    }

    /// Search for `query`. A fresh cache entry short-circuits the network call.
    pub async fn search(&self, query: &str) -> Result<Listing> {
        let key = normalize_query(query);

        if let Some(cache) = &self.cache {
            if let Some(raw) = cache.get(&key) {
                debug!(query = %key, entries = raw.entries.len(), "Listing cache hit");
                return Ok(Listing::from_raw(raw, true));
            }
        }

        let raw = self.source.fetch(query).await?;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(&key, &raw) {
                warn!(query = %key, error = %e, "Failed to write listing cache");
            }
        }

        Ok(Listing::from_raw(raw, false))
    }
}

/// nyaa.si HTML listing scraper
pub struct NyaaClient {
    client: reqwest::Client,
    base_url: String,
    category: String,
    filter: String,
    pages: u32,
}

impl NyaaClient {
    pub fn new(config: &ListingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            category: config.category.clone(),
            filter: config.filter.clone(),
            pages: config.pages.max(1),
        })
    }

    fn search_url(&self, query: &str, page: u32) -> String {
        let mut url = format!(
            "{}/?f={}&c={}&q={}",
            self.base_url,
            self.filter,
            self.category,
            urlencoding::encode(query)
        );
        if page > 1 {
            url.push_str(&format!("&p={}", page));
        }
        url
    }

    async fn fetch_page(&self, query: &str, page: u32) -> Result<RawListing> {
        let url = self.search_url(query, page);
        debug!(url = %url, "Searching nyaa.si");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::ListingUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::ListingUnavailable(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        let html = response
            .text()
            .await
            .map_err(|e| Error::ListingUnavailable(e.to_string()))?;
        Ok(self.parse_results(&html))
    }

    /// Parse the HTML search results page
    fn parse_results(&self, html: &str) -> RawListing {
        let document = Html::parse_document(html);

        // Selectors for nyaa.si table structure
        let row_selector =
            Selector::parse("table.torrent-list tbody tr").expect("Invalid row selector");
        let cell_selector = Selector::parse("td").expect("Invalid cell selector");
        let link_selector = Selector::parse("a").expect("Invalid link selector");

        let mut listing = RawListing::default();

        for row in document.select(&row_selector) {
            let cells: Vec<_> = row.select(&cell_selector).collect();

            // 0: Category, 1: Name (with links), 2: Links (torrent/magnet), ...
            if cells.len() < 3 {
                listing.malformed += 1;
                continue;
            }

            // Direct /view/ID links only (exclude comment links)
            let title = cells[1]
                .select(&link_selector)
                .find(|a| {
                    a.attr("href").is_some_and(|h| {
                        h.starts_with("/view/") && !h.contains('?') && !h.contains('#')
                    })
                })
                .map(|a| {
                    a.attr("title")
                        .map(str::to_string)
                        .unwrap_or_else(|| a.text().collect::<String>())
                        .trim()
                        .to_string()
                })
                .filter(|t| !t.is_empty());

            let mut torrent_url = None;
            let mut magnet_link = None;
            for link in cells[2].select(&link_selector) {
                if let Some(href) = link.attr("href") {
                    if href.ends_with(".torrent") {
                        torrent_url = Some(format!("{}{}", self.base_url, href));
                    } else if href.starts_with("magnet:") {
                        magnet_link = Some(href.to_string());
                    }
                }
            }

            match (title, torrent_url.or(magnet_link)) {
                (Some(title), Some(locator)) => listing.entries.push(ListingEntry { title, locator }),
                _ => listing.malformed += 1,
            }
        }

        debug!(
            count = listing.entries.len(),
            malformed = listing.malformed,
            "Parsed nyaa search results"
        );
        listing
    }
}

#[async_trait]
impl ReleaseSource for NyaaClient {
    async fn fetch(&self, query: &str) -> Result<RawListing> {
        // The first page decides reachability; later pages only add results
        let mut listing = self.fetch_page(query, 1).await?;

        for page in 2..=self.pages {
            match self.fetch_page(query, page).await {
                Ok(more) if more.entries.is_empty() && more.malformed == 0 => break,
                Ok(more) => {
                    listing.entries.extend(more.entries);
                    listing.malformed += more.malformed;
                }
                Err(e) => {
                    warn!(query = %query, page, error = %e, "Listing page failed, keeping earlier pages");
                    break;
                }
            }
        }

        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const PAGE: &str = r#"
<html><body>
<table class="table torrent-list">
<tbody>
<tr class="success">
  <td><a href="/?c=1_2" title="Anime - English-translated">cat</a></td>
  <td colspan="2">
    <a href="/view/1#comments" class="comments">3</a>
    <a href="/view/1" title="[SubsPlease] Example Show - 04 (1080p) [ABCD1234].mkv">[SubsPlease] Example Show - 04 (1080p) [ABCD1234].mkv</a>
  </td>
  <td class="text-center">
    <a href="/download/1.torrent"><i class="fa fa-fw fa-download"></i></a>
    <a href="magnet:?xt=urn:btih:aaaa"><i class="fa fa-fw fa-magnet"></i></a>
  </td>
  <td>1.4 GiB</td><td>2024-01-05 12:00</td><td>100</td><td>3</td><td>1000</td>
</tr>
<tr class="default">
  <td><a href="/?c=1_2">cat</a></td>
  <td colspan="2"><a href="/view/2">[Group] Example Show 01-12 [Batch]</a></td>
  <td class="text-center"><a href="magnet:?xt=urn:btih:bbbb"><i class="fa fa-magnet"></i></a></td>
  <td>14 GiB</td><td>2024-01-05 12:00</td><td>10</td><td>1</td><td>50</td>
</tr>
<tr class="default">
  <td><a href="/?c=1_2">cat</a></td>
  <td colspan="2"><a href="/view/3">No links here</a></td>
  <td class="text-center"></td>
  <td>1 GiB</td><td>2024-01-05 12:00</td><td>1</td><td>0</td><td>5</td>
</tr>
</tbody>
</table>
</body></html>
"#;

    fn client() -> NyaaClient {
        NyaaClient::new(&ListingConfig::default()).unwrap()
    }

    #[test]
    fn test_parse_results() {
        let listing = client().parse_results(PAGE);

        assert_eq!(listing.malformed, 1);
        assert_eq!(
            listing.entries,
            vec![
                ListingEntry {
                    title: "[SubsPlease] Example Show - 04 (1080p) [ABCD1234].mkv".to_string(),
                    locator: "https://nyaa.si/download/1.torrent".to_string(),
                },
                ListingEntry {
                    title: "[Group] Example Show 01-12 [Batch]".to_string(),
                    locator: "magnet:?xt=urn:btih:bbbb".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_search_url() {
        let client = client();
        assert_eq!(
            client.search_url("Example Show", 1),
            "https://nyaa.si/?f=2&c=1_2&q=Example%20Show"
        );
        assert!(client.search_url("Example Show", 3).ends_with("&p=3"));
    }

    #[test]
    fn test_candidate_from_entry() {
        let entries = client().parse_results(PAGE).entries;
        let mut candidates = entries
            .into_iter()
            .enumerate()
            .map(|(i, e)| RemoteCandidate::from_entry(e, i));

        let single = candidates.next().unwrap();
        assert_eq!(single.group.as_deref(), Some("SubsPlease"));
        assert_eq!(single.series_title.as_deref(), Some("Example Show"));
        assert_eq!(single.episode, Some(EpisodeNumber::new(4)));
        assert_eq!(single.resolution.as_deref(), Some("1080p"));

        let batch = candidates.next().unwrap();
        assert_eq!(batch.episode, None);
        assert_eq!(batch.group_name(), "Group");
        assert_eq!(batch.position, 1);
    }

    struct CountingSource {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ReleaseSource for CountingSource {
        async fn fetch(&self, _query: &str) -> Result<RawListing> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::ListingUnavailable("down".to_string()));
            }
            Ok(RawListing {
                entries: vec![ListingEntry {
                    title: "[SubsPlease] Example Show - 04 [1080p]".to_string(),
                    locator: "magnet:?xt=urn:btih:cccc".to_string(),
                }],
                malformed: 2,
            })
        }
    }

    #[tokio::test]
    async fn test_cache_short_circuits_source() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ListingCache::new(dir.path(), std::time::Duration::from_secs(3600));
        let client = ListingClient::new(
            CountingSource {
                calls: AtomicUsize::new(0),
                fail: false,
            },
            Some(cache),
        );

        let first = client.search("Example Show").await.unwrap();
        let second = client.search("  example   SHOW ").await.unwrap();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(second.malformed, 2);
        assert_eq!(second.candidates, first.candidates);
        assert_eq!(client.source.calls.load(Ordering::SeqCst), 1);
    }

    const SECOND_PAGE: &str = r#"
<html><body><table class="table torrent-list"><tbody>
<tr class="success">
  <td><a href="/?c=1_2">cat</a></td>
  <td colspan="2"><a href="/view/9" title="[SubsPlease] Example Show - 03 (1080p) [EFGH5678].mkv">x</a></td>
  <td class="text-center"><a href="magnet:?xt=urn:btih:dddd"><i class="fa fa-magnet"></i></a></td>
</tr>
</tbody></table></body></html>
"#;

    /// Local stand-in for nyaa.si: pages missing from `pages` answer 500
    async fn serve_pages(pages: Vec<(u32, &'static str)>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&chunk[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&request);
                let page = request
                    .split_whitespace()
                    .nth(1)
                    .and_then(|path| path.split("&p=").nth(1))
                    .and_then(|p| p.parse::<u32>().ok())
                    .unwrap_or(1);

                let response = match pages.iter().find(|(n, _)| *n == page) {
                    Some((_, body)) => format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    ),
                    None => "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_string(),
                };
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        format!("http://{}", addr)
    }

    fn paged_client(base_url: String, pages: u32) -> NyaaClient {
        NyaaClient::new(&ListingConfig {
            base_url,
            pages,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_later_page_failure_keeps_earlier_pages() {
        let base_url = serve_pages(vec![(1, PAGE), (2, SECOND_PAGE)]).await;
        let client = paged_client(base_url, 4);

        let listing = client.fetch("Example Show").await.unwrap();
        let titles: Vec<_> = listing.entries.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(
            titles,
            vec![
                "[SubsPlease] Example Show - 04 (1080p) [ABCD1234].mkv",
                "[Group] Example Show 01-12 [Batch]",
                "[SubsPlease] Example Show - 03 (1080p) [EFGH5678].mkv",
            ]
        );
        assert_eq!(listing.malformed, 1);
    }

    #[tokio::test]
    async fn test_first_page_failure_is_unavailable() {
        let base_url = serve_pages(vec![(2, SECOND_PAGE)]).await;
        let client = paged_client(base_url, 2);

        assert!(matches!(
            client.fetch("Example Show").await,
            Err(Error::ListingUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable_source_propagates() {
        let client = ListingClient::new(
            CountingSource {
                calls: AtomicUsize::new(0),
                fail: true,
            },
            None,
        );
        assert!(matches!(
            client.search("Example Show").await,
            Err(Error::ListingUnavailable(_))
        ));
    }
}
