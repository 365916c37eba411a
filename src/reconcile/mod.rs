//! One reconciliation pass: load the library, bring it up to date with the
//! local disk, then for every watched series query the listing, match, and
//! dispatch what is missing. Finishes with a single atomic save.

pub mod lock;

pub use lock::RunLock;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::dispatch::{Dispatcher, FailureReason, Outcome};
use crate::error::Error;
use crate::library::models::{EpisodeNumber, EpisodeRecord, Provenance, Series};
use crate::library::{Library, LibraryStore, MergeSummary, scan_library_dirs};
use crate::matcher::{Decision, MatchPolicy, RejectReason, match_releases};
use crate::nyaa::{ListingClient, ReleaseSource, RemoteCandidate};
use crate::torrent::Downloader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Idle,
    Loading,
    Querying,
    Matching,
    Dispatching,
    Saving,
    Done,
    Errored,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Idle => "idle",
            RunStage::Loading => "loading",
            RunStage::Querying => "querying",
            RunStage::Matching => "matching",
            RunStage::Dispatching => "dispatching",
            RunStage::Saving => "saving",
            RunStage::Done => "done",
            RunStage::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// A pass that ended in `Errored`, with the stage it failed in
#[derive(Debug, thiserror::Error)]
#[error("reconciliation failed while {stage}: {error}")]
pub struct RunFailure {
    pub stage: RunStage,
    pub error: Error,
}

impl RunFailure {
    fn at(stage: RunStage) -> impl FnOnce(Error) -> Self {
        move |error| Self { stage, error }
    }
}

/// An accepted release, dispatched or (in a dry run) only planned
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedRelease {
    pub series_id: String,
    pub series_title: String,
    pub episode: EpisodeNumber,
    pub release: String,
    pub group: String,
    /// Set once the downloader accepted it
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchFailure {
    pub series_id: String,
    pub episode: EpisodeNumber,
    pub release: String,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesError {
    pub series_id: String,
    pub error: String,
}

/// What one pass did. Partial success is still success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub local: MergeSummary,
    pub series_checked: usize,
    pub matched: usize,
    pub downloaded: Vec<AcceptedRelease>,
    pub planned: Vec<AcceptedRelease>,
    pub rejected: BTreeMap<RejectReason, usize>,
    pub series_errors: Vec<SeriesError>,
    pub failures: Vec<DispatchFailure>,
}

impl ReconcileReport {
    pub fn rejected_total(&self) -> usize {
        self.rejected.values().sum()
    }

    fn reject(&mut self, reason: RejectReason, count: usize) {
        if count > 0 {
            *self.rejected.entry(reason).or_default() += count;
        }
    }
}

/// Where local episode files live
#[derive(Debug, Clone)]
pub struct LibraryRoots {
    pub base_dir: PathBuf,
    pub stalled_dir: PathBuf,
    pub video_extensions: Vec<String>,
}

pub struct Reconciler<S, D> {
    listing: ListingClient<S>,
    dispatcher: Dispatcher<D>,
    policy: MatchPolicy,
    queries: BTreeMap<String, String>,
    dry_run: bool,
}

impl<S: ReleaseSource, D: Downloader> Reconciler<S, D> {
    pub fn new(
        listing: ListingClient<S>,
        dispatcher: Dispatcher<D>,
        policy: MatchPolicy,
        queries: BTreeMap<String, String>,
    ) -> Self {
        Self {
            listing,
            dispatcher,
            policy,
            queries,
            dry_run: false,
        }
    }

    /// Match and report only: nothing is dispatched or saved
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    fn query_for(&self, series: &Series) -> String {
        self.queries
            .get(&series.id)
            .or(series.query.as_ref())
            .cloned()
            .unwrap_or_else(|| series.title.clone())
    }

    /// Lock, load, scan, reconcile, save.
    ///
    /// Store corruption and save failures end the pass as `Errored`; everything
    /// that goes wrong for a single series or episode is only reported.
    pub async fn run_pass(
        &self,
        store: &LibraryStore,
        lock_path: &Path,
        roots: &LibraryRoots,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, RunFailure> {
        let lock = RunLock::acquire(lock_path).map_err(RunFailure::at(RunStage::Idle))?;
        debug!(lock = %lock.path().display(), "Holding run lock for the pass");

        debug!(stage = %RunStage::Loading, path = %store.path().display(), "Loading library");
        let mut library = store.load().map_err(RunFailure::at(RunStage::Loading))?;

        let local = match scan_library_dirs(
            &roots.base_dir,
            &roots.stalled_dir,
            &roots.video_extensions,
        ) {
            Ok(found) => library.merge_local(&found, now),
            Err(e) => {
                warn!(error = %e, "Local scan failed, continuing with stored state");
                MergeSummary::default()
            }
        };

        let mut report = self.reconcile(&mut library, now).await;
        report.local = local;

        if self.dry_run {
            info!("Dry run, library state not saved");
        } else {
            debug!(stage = %RunStage::Saving, "Saving library");
            store
                .save(&library)
                .map_err(RunFailure::at(RunStage::Saving))?;
        }

        info!(
            stage = %RunStage::Done,
            checked = report.series_checked,
            downloaded = report.downloaded.len(),
            rejected = report.rejected_total(),
            series_errors = report.series_errors.len(),
            failures = report.failures.len(),
            "Reconciliation pass finished"
        );
        Ok(report)
    }

    /// Bring every watched series up to date. Successful dispatches become
    /// present records stamped with `now`.
    pub async fn reconcile(&self, library: &mut Library, now: DateTime<Utc>) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let watching: Vec<Series> = library
            .series
            .iter()
            .filter(|s| s.is_reconciled())
            .cloned()
            .collect();

        for series in &watching {
            report.series_checked += 1;
            let query = self.query_for(series);

            debug!(stage = %RunStage::Querying, series = %series.id, query = %query, "Querying listing");
            let listing = match self.listing.search(&query).await {
                Ok(listing) => listing,
                Err(e) => {
                    warn!(series = %series.id, error = %e, "Skipping series this pass");
                    report.series_errors.push(SeriesError {
                        series_id: series.id.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            report.reject(RejectReason::Unparsable, listing.malformed);

            debug!(stage = %RunStage::Matching, series = %series.id, candidates = listing.candidates.len(), "Matching releases");
            let decisions = match_releases(
                series,
                &series.present_numbers(),
                listing.candidates,
                &self.policy,
            );

            let mut accepted = Vec::new();
            for d in decisions {
                match d.decision {
                    Decision::Accept => accepted.push(d.candidate),
                    Decision::Reject(reason) => {
                        debug!(series = %series.id, title = %d.candidate.title, reason = %reason, "Rejected");
                        report.reject(reason, 1);
                    }
                }
            }
            report.matched += accepted.len();

            let destination = self.dispatcher.destination_for(series);
            for candidate in accepted {
                // Accepted candidates always carry an episode number
                let Some(episode) = candidate.episode else {
                    continue;
                };
                let mut entry = AcceptedRelease {
                    series_id: series.id.clone(),
                    series_title: series.title.clone(),
                    episode,
                    release: candidate.title.clone(),
                    group: candidate.group_name().to_string(),
                    path: None,
                };

                if self.dry_run {
                    info!(series = %series.id, episode = %episode, release = %candidate.title, "Would download");
                    report.planned.push(entry);
                    continue;
                }

                debug!(stage = %RunStage::Dispatching, series = %series.id, episode = %episode, "Dispatching");
                match self.dispatcher.dispatch(&candidate, &destination).await {
                    Outcome::Success(path) => {
                        if let Err(e) =
                            record_download(library, series, &candidate, episode, &path, now)
                        {
                            warn!(series = %series.id, error = %e, "Could not record download");
                        }

                        info!(series = %series.id, episode = %episode, release = %candidate.title, "Downloaded episode");
                        entry.path = Some(path);
                        report.downloaded.push(entry);
                    }
                    Outcome::Failure(reason) => {
                        report.failures.push(DispatchFailure {
                            series_id: series.id.clone(),
                            episode,
                            release: candidate.title,
                            reason,
                        });
                    }
                }
            }
        }

        report
    }
}

/// Store a finished dispatch as a present episode. An existing record keeps
/// its watch status.
fn record_download(
    library: &mut Library,
    series: &Series,
    candidate: &RemoteCandidate,
    episode: EpisodeNumber,
    path: &Path,
    now: DateTime<Utc>,
) -> Result<bool, Error> {
    let mut record = EpisodeRecord::present(
        episode,
        path.to_path_buf(),
        Provenance {
            group: candidate.group_name().to_string(),
            release: candidate.title.clone(),
            resolution: candidate.resolution.clone(),
            recorded_at: now,
        },
    );
    if let Some(existing) = series.get_episode(episode) {
        record.status = existing.status;
    }
    library.upsert_episode(&series.id, record)
}

/// A release picked by hand rather than found in the listing
#[derive(Debug, Clone)]
pub struct ManualRelease {
    /// Magnet link, `.torrent` URL or local `.torrent` path
    pub locator: String,
    pub episode: EpisodeNumber,
    pub group: Option<String>,
    pub resolution: Option<String>,
}

/// Dispatch a hand-picked release for a tracked series and record it like a
/// matched one. No trust or listing checks apply. Callers hold the run lock.
pub async fn add_release<D: Downloader>(
    dispatcher: &Dispatcher<D>,
    library: &mut Library,
    series_id: &str,
    release: ManualRelease,
    now: DateTime<Utc>,
) -> Result<AcceptedRelease, Error> {
    let series = library
        .get_series(series_id)
        .cloned()
        .ok_or_else(|| Error::SeriesNotFound(series_id.to_string()))?;

    let resolution = release
        .resolution
        .as_deref()
        .map(|r| format!(" [{}]", r))
        .unwrap_or_default();
    let title = match &release.group {
        Some(group) => format!("[{}] {} - {}{}", group, series.title, release.episode, resolution),
        None => format!("{} - {}{}", series.title, release.episode, resolution),
    };
    let candidate = RemoteCandidate {
        title,
        group: release.group,
        series_title: Some(series.title.clone()),
        episode: Some(release.episode),
        resolution: release.resolution,
        locator: release.locator,
        position: 0,
    };

    let destination = dispatcher.destination_for(&series);
    match dispatcher.dispatch(&candidate, &destination).await {
        Outcome::Success(path) => {
            record_download(library, &series, &candidate, release.episode, &path, now)?;
            info!(series = %series.id, episode = %release.episode, release = %candidate.title, "Added episode");
            Ok(AcceptedRelease {
                series_id: series.id.clone(),
                series_title: series.title.clone(),
                episode: release.episode,
                group: candidate.group_name().to_string(),
                release: candidate.title,
                path: Some(path),
            })
        }
        Outcome::Failure(reason) => Err(Error::DispatchFailed {
            release: candidate.title,
            reason: reason.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap, HashSet};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::dispatch::tests::FakeDownloader;
    use crate::error::Result;
    use crate::library::models::{SeriesStatus, WatchStatus};
    use crate::matcher::TieBreak;
    use crate::nyaa::{ListingEntry, RawListing};

    fn ep(n: u32) -> EpisodeNumber {
        EpisodeNumber::new(n)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 5, 12, 0, 0).unwrap()
    }

    fn locator(title: &str) -> String {
        format!("magnet:{}", title)
    }

    /// Listing source keyed by query; queries in `down` are unreachable
    #[derive(Default)]
    struct FakeSource {
        listings: HashMap<String, Vec<String>>,
        down: HashSet<String>,
    }

    impl FakeSource {
        fn with(mut self, query: &str, titles: &[&str]) -> Self {
            self.listings.insert(
                query.to_string(),
                titles.iter().map(|t| t.to_string()).collect(),
            );
            self
        }
    }

    #[async_trait]
    impl ReleaseSource for FakeSource {
        async fn fetch(&self, query: &str) -> Result<RawListing> {
            if self.down.contains(query) {
                return Err(Error::ListingUnavailable("connection refused".to_string()));
            }
            let entries = self
                .listings
                .get(query)
                .map(|titles| {
                    titles
                        .iter()
                        .map(|t| ListingEntry {
                            title: t.clone(),
                            locator: locator(t),
                        })
                        .collect()
                })
                .unwrap_or_default();
            Ok(RawListing {
                entries,
                malformed: 0,
            })
        }
    }

    fn reconciler(
        source: FakeSource,
        downloader: FakeDownloader,
    ) -> Reconciler<FakeSource, FakeDownloader> {
        let policy = MatchPolicy::new(
            &["Group1".to_string(), "Group2".to_string()],
            &[],
            vec![TieBreak::GroupPriority, TieBreak::Resolution],
        );
        Reconciler::new(
            ListingClient::new(source, None),
            Dispatcher::new(downloader, PathBuf::from("/anime"), Duration::from_secs(5)),
            policy,
            BTreeMap::new(),
        )
    }

    fn example_listing() -> FakeSource {
        FakeSource::default().with(
            "Example Show",
            &[
                "[Group1] Example Show - 04 [720p]",
                "[Group2] Example Show - 04 [1080p]",
                "[Group3] Example Show - 04 [1080p]",
            ],
        )
    }

    fn library_with(title: &str, present: &[u32]) -> Library {
        let mut library = Library::default();
        library.track(title, &[], None, None).unwrap();
        let id = library.series[0].id.clone();
        for &n in present {
            library
                .upsert_episode(
                    &id,
                    EpisodeRecord::present(
                        ep(n),
                        PathBuf::from(format!("/anime/{} - {:02}.mkv", title, n)),
                        Provenance {
                            group: "Group1".to_string(),
                            release: format!("[Group1] {} - {:02}", title, n),
                            resolution: None,
                            recorded_at: now(),
                        },
                    ),
                )
                .unwrap();
        }
        library
    }

    #[tokio::test]
    async fn test_example_show_pass() {
        let reconciler = reconciler(example_listing(), FakeDownloader::default());
        let mut library = library_with("Example Show", &[1, 2, 3]);

        let report = reconciler.reconcile(&mut library, now()).await;

        assert_eq!(report.series_checked, 1);
        assert_eq!(report.matched, 1);
        assert_eq!(report.downloaded.len(), 1);
        assert_eq!(report.rejected.get(&RejectReason::Superseded), Some(&1));
        assert_eq!(report.rejected.get(&RejectReason::UntrustedGroup), Some(&1));

        let series = library.get_series("example-show").unwrap();
        let record = series.get_episode(ep(4)).unwrap();
        assert!(record.present);
        let provenance = record.provenance.as_ref().unwrap();
        assert_eq!(provenance.group, "Group2");
        assert_eq!(provenance.resolution.as_deref(), Some("1080p"));
        assert_eq!(provenance.recorded_at, now());

        let calls = reconciler.dispatcher.downloader().calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![(
                locator("[Group2] Example Show - 04 [1080p]"),
                PathBuf::from("/anime/Example Show")
            )]
        );
    }

    #[tokio::test]
    async fn test_second_pass_is_a_no_op() {
        let reconciler = reconciler(example_listing(), FakeDownloader::default());
        let mut library = library_with("Example Show", &[1, 2, 3]);

        reconciler.reconcile(&mut library, now()).await;
        let after_first = library.clone();

        let report = reconciler.reconcile(&mut library, now()).await;
        assert_eq!(library, after_first);
        assert!(report.downloaded.is_empty());
        assert_eq!(report.rejected.get(&RejectReason::AlreadyHave), Some(&3));
        assert_eq!(reconciler.dispatcher.downloader().call_count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_series_does_not_block_others() {
        let mut source = example_listing().with(
            "Other Show",
            &["[Group1] Other Show - 01 [1080p]"],
        );
        source.down.insert("Example Show".to_string());
        let reconciler = reconciler(source, FakeDownloader::default());

        let mut library = library_with("Example Show", &[1, 2, 3]);
        library.track("Other Show", &[], None, None).unwrap();

        let report = reconciler.reconcile(&mut library, now()).await;

        assert_eq!(report.series_checked, 2);
        assert_eq!(
            report.series_errors.iter().map(|e| e.series_id.as_str()).collect::<Vec<_>>(),
            vec!["example-show"]
        );
        assert_eq!(report.downloaded.len(), 1);
        assert!(library.get_series("other-show").unwrap().get_episode(ep(1)).is_some());
        assert!(library.get_series("example-show").unwrap().get_episode(ep(4)).is_none());
    }

    #[tokio::test]
    async fn test_failed_dispatch_leaves_gap_for_next_pass() {
        let winner = locator("[Group2] Example Show - 04 [1080p]");
        let downloader = FakeDownloader {
            failing: HashSet::from([winner.clone()]),
            ..Default::default()
        };
        let failing = reconciler(example_listing(), downloader);
        let mut library = library_with("Example Show", &[1, 2, 3]);

        let report = failing.reconcile(&mut library, now()).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].episode, ep(4));
        assert!(matches!(report.failures[0].reason, FailureReason::Downloader(_)));
        assert!(library.get_series("example-show").unwrap().get_episode(ep(4)).is_none());

        let healthy = reconciler(example_listing(), FakeDownloader::default());
        let report = healthy.reconcile(&mut library, now()).await;
        assert_eq!(report.downloaded.len(), 1);
        assert_eq!(report.downloaded[0].release, "[Group2] Example Show - 04 [1080p]");
    }

    #[tokio::test]
    async fn test_dry_run_dispatches_nothing() {
        let reconciler = reconciler(example_listing(), FakeDownloader::default()).dry_run(true);
        let mut library = library_with("Example Show", &[1, 2, 3]);
        let before = library.clone();

        let report = reconciler.reconcile(&mut library, now()).await;

        assert_eq!(library, before);
        assert_eq!(report.planned.len(), 1);
        assert_eq!(report.planned[0].episode, ep(4));
        assert_eq!(report.planned[0].group, "Group2");
        assert_eq!(reconciler.dispatcher.downloader().call_count(), 0);
    }

    #[tokio::test]
    async fn test_only_watching_series_are_checked() {
        let reconciler = reconciler(example_listing(), FakeDownloader::default());
        let mut library = library_with("Example Show", &[1, 2, 3]);
        library
            .mark_series("example-show", SeriesStatus::Stalled)
            .unwrap();

        let report = reconciler.reconcile(&mut library, now()).await;
        assert_eq!(report.series_checked, 0);
        assert_eq!(reconciler.dispatcher.downloader().call_count(), 0);
    }

    #[tokio::test]
    async fn test_query_override_and_status_kept() {
        let source = FakeSource::default().with(
            "example show custom",
            &["[Group1] Example Show - 04 [1080p]"],
        );
        let mut reconciler = reconciler(source, FakeDownloader::default());
        reconciler
            .queries
            .insert("example-show".to_string(), "example show custom".to_string());

        let mut library = library_with("Example Show", &[1, 2, 3]);
        // A record that exists but was never fetched keeps its status
        library
            .upsert_episode(
                "example-show",
                EpisodeRecord {
                    number: ep(4),
                    present: false,
                    status: WatchStatus::Manual,
                    path: None,
                    provenance: None,
                },
            )
            .unwrap();

        let report = reconciler.reconcile(&mut library, now()).await;
        assert_eq!(report.downloaded.len(), 1);

        let record = library
            .get_series("example-show")
            .unwrap()
            .get_episode(ep(4))
            .unwrap();
        assert!(record.present);
        assert_eq!(record.status, WatchStatus::Manual);
    }

    fn roots(dir: &Path) -> LibraryRoots {
        LibraryRoots {
            base_dir: dir.join("anime"),
            stalled_dir: dir.join("anime").join("stalled"),
            video_extensions: vec!["mkv".to_string()],
        }
    }

    #[tokio::test]
    async fn test_run_pass_scans_matches_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let roots = roots(dir.path());
        let show_dir = roots.base_dir.join("Example Show");
        std::fs::create_dir_all(&show_dir).unwrap();
        for n in 1..=3 {
            std::fs::write(
                show_dir.join(format!("[Group1] Example Show - {:02} [1080p].mkv", n)),
                b"",
            )
            .unwrap();
        }

        let store = LibraryStore::new(dir.path().join("state").join("library.toml"));
        let lock_path = dir.path().join("state").join("run.lock");
        let reconciler = reconciler(example_listing(), FakeDownloader::default());

        let report = reconciler
            .run_pass(&store, &lock_path, &roots, now())
            .await
            .unwrap();
        assert_eq!(report.local.new_series, 1);
        assert_eq!(report.local.new_episodes, 3);
        assert_eq!(report.downloaded.len(), 1);

        let saved = store.load().unwrap();
        let series = saved.get_series("example-show").unwrap();
        assert_eq!(series.present_numbers().len(), 4);

        // Lock is released after the pass
        let report = reconciler
            .run_pass(&store, &lock_path, &roots, now())
            .await
            .unwrap();
        assert!(report.downloaded.is_empty());
        assert_eq!(store.load().unwrap(), saved);
    }

    #[tokio::test]
    async fn test_downloaded_release_scanned_back_into_same_series() {
        let frieren = |titles: &[&str]| FakeSource::default().with("Frieren", titles);
        let mut library = Library::default();
        library.track("Frieren", &[], None, None).unwrap();

        let first = reconciler(
            frieren(&["[Group1] Sousou no Frieren - 04 [1080p]"]),
            FakeDownloader::default(),
        );
        let report = first.reconcile(&mut library, now()).await;
        assert_eq!(report.downloaded.len(), 1);

        // The finished file shows up under the library root
        let dir = tempfile::tempdir().unwrap();
        let roots = roots(dir.path());
        let show_dir = roots.base_dir.join("Frieren");
        std::fs::create_dir_all(&show_dir).unwrap();
        std::fs::write(show_dir.join("[Group1] Sousou no Frieren - 04 [1080p].mkv"), b"").unwrap();
        let found =
            scan_library_dirs(&roots.base_dir, &roots.stalled_dir, &roots.video_extensions)
                .unwrap();
        let summary = library.merge_local(&found, now());
        assert_eq!(summary.new_series, 0);
        assert_eq!(library.series.len(), 1);

        let second = reconciler(
            frieren(&[
                "[Group1] Sousou no Frieren - 04 [1080p]",
                "[Group1] Sousou no Frieren - 05 [1080p]",
            ]),
            FakeDownloader::default(),
        );
        let report = second.reconcile(&mut library, now()).await;
        assert_eq!(report.series_checked, 1);
        assert_eq!(report.downloaded.len(), 1);
        assert_eq!(report.downloaded[0].episode, ep(5));
        assert_eq!(second.dispatcher.downloader().call_count(), 1);
        assert_eq!(
            library.get_series("frieren").unwrap().present_numbers(),
            BTreeSet::from([ep(4), ep(5)])
        );
    }

    fn manual(locator: &str, episode: u32, group: Option<&str>) -> ManualRelease {
        ManualRelease {
            locator: locator.to_string(),
            episode: ep(episode),
            group: group.map(str::to_string),
            resolution: Some("1080p".to_string()),
        }
    }

    #[tokio::test]
    async fn test_add_release_records_episode() {
        let dispatcher = Dispatcher::new(
            FakeDownloader::default(),
            PathBuf::from("/anime"),
            Duration::from_secs(5),
        );
        let mut library = library_with("Example Show", &[1, 2, 3]);

        let added = add_release(
            &dispatcher,
            &mut library,
            "example-show",
            manual("magnet:?xt=urn:btih:abcd", 4, Some("Group9")),
            now(),
        )
        .await
        .unwrap();

        assert_eq!(added.release, "[Group9] Example Show - 04 [1080p]");
        assert_eq!(
            dispatcher.downloader().calls.lock().unwrap().clone(),
            vec![(
                "magnet:?xt=urn:btih:abcd".to_string(),
                PathBuf::from("/anime/Example Show")
            )]
        );

        let record = library
            .get_series("example-show")
            .unwrap()
            .get_episode(ep(4))
            .unwrap();
        assert!(record.present);
        assert_eq!(record.path, added.path);
        let provenance = record.provenance.as_ref().unwrap();
        assert_eq!(provenance.group, "Group9");
        assert_eq!(provenance.resolution.as_deref(), Some("1080p"));
    }

    #[tokio::test]
    async fn test_add_release_failure_records_nothing() {
        let dispatcher = Dispatcher::new(
            FakeDownloader {
                failing: HashSet::from(["bad.torrent".to_string()]),
                ..Default::default()
            },
            PathBuf::from("/anime"),
            Duration::from_secs(5),
        );
        let mut library = library_with("Example Show", &[1, 2, 3]);
        let before = library.clone();

        let err = add_release(
            &dispatcher,
            &mut library,
            "example-show",
            manual("bad.torrent", 4, None),
            now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::DispatchFailed { .. }));
        assert_eq!(library, before);

        let err = add_release(
            &dispatcher,
            &mut library,
            "missing",
            manual("x.torrent", 1, None),
            now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::SeriesNotFound(_)));
        assert_eq!(dispatcher.downloader().call_count(), 1);
    }

    #[tokio::test]
    async fn test_run_pass_refuses_concurrent_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = LibraryStore::new(dir.path().join("library.toml"));
        let lock_path = dir.path().join("run.lock");
        let _held = RunLock::acquire(&lock_path).unwrap();

        let reconciler = reconciler(example_listing(), FakeDownloader::default());
        let failure = reconciler
            .run_pass(&store, &lock_path, &roots(dir.path()), now())
            .await
            .unwrap_err();

        assert_eq!(failure.stage, RunStage::Idle);
        assert!(matches!(failure.error, Error::AlreadyRunning(_)));
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_run_pass_corrupt_store_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LibraryStore::new(dir.path().join("library.toml"));
        std::fs::write(store.path(), "[[series]]\nid = ").unwrap();

        let reconciler = reconciler(example_listing(), FakeDownloader::default());
        let failure = reconciler
            .run_pass(&store, &dir.path().join("run.lock"), &roots(dir.path()), now())
            .await
            .unwrap_err();

        assert_eq!(failure.stage, RunStage::Loading);
        assert!(matches!(failure.error, Error::StoreCorrupt { .. }));
        assert_eq!(reconciler.dispatcher.downloader().call_count(), 0);
    }
}
