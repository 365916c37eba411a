use std::fmt::Write as _;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info, warn};

use crate::config::{self, Config};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::library::parser::{make_series_id, normalize_alias};
use crate::library::{
    EpisodeNumber, Library, LibraryFilter, LibraryStore, Series, SeriesStatus, WatchStatus,
    move_to_stalled, scan_library_dirs,
};
use crate::nyaa::{ListingCache, ListingClient, NyaaClient};
use crate::notify::Notifier;
use crate::reconcile::{
    AcceptedRelease, LibraryRoots, ManualRelease, ReconcileReport, Reconciler, RunFailure,
    RunLock, add_release,
};
use crate::torrent::AnyDownloader;

#[derive(Parser, Debug)]
#[command(name = "tsuzuki", version, about = "Keeps a local anime library in step with nyaa.si")]
pub struct Cli {
    /// Config file to use instead of the platform default
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one reconciliation pass
    Run {
        /// Match and report without downloading or saving
        #[arg(long)]
        dry_run: bool,
    },
    /// Show the library
    List(ListArgs),
    /// Set the status of an episode, or of a whole series when no episode is given
    Mark {
        series: String,
        /// `[episode] <status>`
        #[arg(num_args = 1..=2, required = true, value_name = "EPISODE|STATUS")]
        targets: Vec<String>,
    },
    /// Start tracking a series
    Track {
        title: String,
        #[arg(long = "alias")]
        aliases: Vec<String>,
        /// Listing query to use instead of the title
        #[arg(long)]
        query: Option<String>,
        /// Never fetch episodes below this number
        #[arg(long = "from")]
        from: Option<EpisodeNumber>,
    },
    /// Stop tracking a series and forget its episodes
    Untrack { series: String },
    /// Download a specific release for a tracked series and record it
    Add {
        series: String,
        episode: EpisodeNumber,
        /// Magnet link, `.torrent` URL or local `.torrent` path
        locator: String,
        #[arg(long)]
        group: Option<String>,
        /// Resolution tag such as `1080p`
        #[arg(long)]
        quality: Option<String>,
    },
}

#[derive(clap::Args, Debug, Default)]
pub struct ListArgs {
    /// Exact series id
    #[arg(long)]
    pub series: Option<String>,
    #[arg(long, value_enum)]
    pub status: Option<WatchStatus>,
    /// Substring or all-words match on title and aliases
    #[arg(long)]
    pub search: Option<String>,
    /// Release group substring
    #[arg(long)]
    pub group: Option<String>,
    #[arg(long)]
    pub min_episode: Option<EpisodeNumber>,
    #[arg(long)]
    pub max_episode: Option<EpisodeNumber>,
    /// Only series with activity at or after this RFC 3339 time
    #[arg(long)]
    pub since: Option<DateTime<Utc>>,
    /// Only series with activity at or before this RFC 3339 time
    #[arg(long)]
    pub before: Option<DateTime<Utc>>,
    #[arg(long)]
    pub json: bool,
}

impl ListArgs {
    fn filter(&self) -> LibraryFilter {
        LibraryFilter {
            series: self.series.clone(),
            status: self.status,
            search: self.search.clone(),
            group: self.group.clone(),
            min_episode: self.min_episode,
            max_episode: self.max_episode,
            since: self.since,
            before: self.before,
        }
    }
}

/// Parsed `mark` arguments
#[derive(Debug, Clone, PartialEq)]
pub enum MarkTarget {
    Episode(EpisodeNumber, WatchStatus),
    Series(SeriesStatus),
}

pub fn parse_mark_targets(targets: &[String]) -> Result<MarkTarget> {
    let invalid = |what: &str| Error::InvalidSeries(format!("invalid {}", what));
    match targets {
        [status] => SeriesStatus::from_str(status, true)
            .map(MarkTarget::Series)
            .map_err(|_| invalid(&format!("series status {:?}", status))),
        [episode, status] => {
            let episode: EpisodeNumber = episode
                .parse()
                .map_err(|_| invalid(&format!("episode number {:?}", episode)))?;
            let status = WatchStatus::from_str(status, true)
                .map_err(|_| invalid(&format!("episode status {:?}", status)))?;
            Ok(MarkTarget::Episode(episode, status))
        }
        _ => Err(invalid("mark arguments")),
    }
}

/// Find a series by id, by title, or by one of its aliases
pub fn resolve_series_id(library: &Library, input: &str) -> Result<String> {
    let id = make_series_id(input);
    let alias = normalize_alias(input);
    library
        .series
        .iter()
        .find(|s| s.id == input || s.id == id)
        .or_else(|| library.series.iter().find(|s| s.aliases.contains(&alias)))
        .map(|s| s.id.clone())
        .ok_or_else(|| Error::SeriesNotFound(input.to_string()))
}

/// Load, change, save; under the run lock so no pass is in flight
fn with_library<T>(config: &Config, change: impl FnOnce(&mut Library) -> Result<T>) -> Result<T> {
    let _lock = RunLock::acquire(&config.lock_path())?;
    let store = LibraryStore::new(config.state_path());
    let mut library = store.load()?;
    let result = change(&mut library)?;
    store.save(&library)?;
    Ok(result)
}

/// Failure of a command, classified for the exit status
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Run(#[from] RunFailure),
    #[error(transparent)]
    Other(#[from] Error),
}

pub async fn execute(command: Command, config: &Config) -> std::result::Result<(), CommandError> {
    match command {
        Command::Run { dry_run } => {
            let report = run_once(config, dry_run).await?;
            print!("{}", render_report(&report, dry_run));
        }
        Command::List(args) => list(config, &args)?,
        Command::Mark { series, targets } => mark(config, &series, &targets)?,
        Command::Track {
            title,
            aliases,
            query,
            from,
        } => {
            let series = with_library(config, |library| {
                library.track(&title, &aliases, query, from).cloned()
            })?;
            println!("Tracking {} [{}]", series.title, series.id);
        }
        Command::Untrack { series } => {
            let removed = with_library(config, |library| {
                let id = resolve_series_id(library, &series)?;
                library.untrack(&id)
            })?;
            println!(
                "Removed {} [{}] and {} episode records",
                removed.title,
                removed.id,
                removed.episodes.len()
            );
        }
        Command::Add {
            series,
            episode,
            locator,
            group,
            quality,
        } => {
            let release = ManualRelease {
                locator,
                episode,
                group,
                resolution: quality,
            };
            let added = add(config, &series, release).await?;
            println!("Added {} {}  {}", added.series_title, added.episode, added.release);
        }
    }
    Ok(())
}

async fn add(config: &Config, series: &str, release: ManualRelease) -> Result<AcceptedRelease> {
    let _lock = RunLock::acquire(&config.lock_path())?;
    let store = LibraryStore::new(config.state_path());
    let mut library = store.load()?;
    let id = resolve_series_id(&library, series)?;

    let downloader = AnyDownloader::from_config(config)?;
    let dispatcher = Dispatcher::new(downloader, config.base_dir(), config.fetch_timeout());
    let added = add_release(&dispatcher, &mut library, &id, release, Utc::now()).await?;
    store.save(&library)?;

    Notifier::new(config.notifications.enabled)
        .episode_downloaded(&added.series_title, added.episode);
    Ok(added)
}

async fn run_once(config: &Config, dry_run: bool) -> std::result::Result<ReconcileReport, CommandError> {
    let cache = match config::cache_dir() {
        Ok(dir) => {
            let cache = ListingCache::new(dir, config.cache_timeout());
            debug!(dir = %cache.dir().display(), "Listing cache enabled");
            Some(cache)
        }
        Err(e) => {
            warn!(error = %e, "No cache directory, listing cache disabled");
            None
        }
    };
    let listing = ListingClient::new(NyaaClient::new(&config.listing)?, cache);

    let downloader = AnyDownloader::from_config(config)?;
    info!(downloader = downloader.name(), dry_run, "Starting reconciliation pass");
    let dispatcher = Dispatcher::new(downloader, config.base_dir(), config.fetch_timeout());

    let reconciler = Reconciler::new(
        listing,
        dispatcher,
        config.match_policy(),
        config.queries.clone(),
    )
    .dry_run(dry_run);

    let roots = LibraryRoots {
        base_dir: config.base_dir(),
        stalled_dir: config.stalled_dir(),
        video_extensions: config.general.video_extensions.clone(),
    };
    let store = LibraryStore::new(config.state_path());
    let report = reconciler
        .run_pass(&store, &config.lock_path(), &roots, Utc::now())
        .await?;

    let notifier = Notifier::new(config.notifications.enabled);
    for downloaded in &report.downloaded {
        notifier.episode_downloaded(&downloaded.series_title, downloaded.episode);
    }
    notifier.series_failed(report.series_errors.len());

    Ok(report)
}

fn list(config: &Config, args: &ListArgs) -> Result<()> {
    let store = LibraryStore::new(config.state_path());
    let mut library = store.load()?;

    // Show files that arrived since the last pass; nothing is saved here
    let found = scan_library_dirs(
        &config.base_dir(),
        &config.stalled_dir(),
        &config.general.video_extensions,
    )?;
    library.merge_local(&found, Utc::now());

    let series = library.filter(&args.filter());
    if args.json {
        println!("{}", serde_json::to_string_pretty(&series)?);
    } else {
        print!("{}", render_library(&series));
    }
    Ok(())
}

fn mark(config: &Config, series: &str, targets: &[String]) -> Result<()> {
    let target = parse_mark_targets(targets)?;
    let stalled_dir = config.stalled_dir();

    let message = with_library(config, |library| {
        let id = resolve_series_id(library, series)?;
        match target {
            MarkTarget::Series(status) => {
                library.mark_series(&id, status)?;
                Ok(format!("{} is now {}", id, status.as_str()))
            }
            MarkTarget::Episode(number, status) => {
                let path = library.mark_episode(&id, number, status)?.path.clone();

                if status == WatchStatus::Stalled {
                    if let Some(path) = path.filter(|p| p.exists()) {
                        let moved = move_to_stalled(&path, &stalled_dir)?;
                        if let Some(episode) = library
                            .get_series_mut(&id)
                            .and_then(|s| s.get_episode_mut(number))
                        {
                            episode.path = Some(moved);
                        }
                    }
                }
                Ok(format!("{} episode {} is now {}", id, number, status.as_str()))
            }
        }
    })?;

    println!("{}", message);
    Ok(())
}

pub fn render_library(series: &[&Series]) -> String {
    let mut out = String::new();
    if series.is_empty() {
        out.push_str("No matching series\n");
        return out;
    }

    for s in series {
        let latest = s
            .latest_present()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "-".to_string());
        let watched = s
            .latest_watched()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "{} [{}] {}  present: {}  latest: {}  watched: {}  group: {}",
            s.title,
            s.id,
            s.status.as_str(),
            s.present_numbers().len(),
            latest,
            watched,
            s.latest_group().unwrap_or("-")
        );
        for e in &s.episodes {
            let special = if e.number.is_special() { "*" } else { " " };
            let _ = writeln!(
                out,
                "  {:>5}{} {:<9}  {}",
                e.number.to_string(),
                special,
                e.status.as_str(),
                e.file_name().unwrap_or_else(|| "(not present)".to_string())
            );
        }
    }
    out
}

pub fn render_report(report: &ReconcileReport, dry_run: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Checked {} series, matched {}, downloaded {}",
        report.series_checked,
        report.matched,
        report.downloaded.len()
    );

    let local = report.local;
    if local.new_series + local.new_episodes + local.relocated > 0 {
        let _ = writeln!(
            out,
            "Local scan: {} new series, {} new episodes, {} relocated",
            local.new_series, local.new_episodes, local.relocated
        );
    }

    for d in &report.downloaded {
        let _ = writeln!(out, "  + {} {}  {}", d.series_title, d.episode, d.release);
    }
    if dry_run {
        for p in &report.planned {
            let _ = writeln!(out, "  ~ {} {}  {} (dry run)", p.series_title, p.episode, p.release);
        }
    }

    if !report.rejected.is_empty() {
        let counts: Vec<String> = report
            .rejected
            .iter()
            .map(|(reason, count)| format!("{}={}", reason, count))
            .collect();
        let _ = writeln!(out, "Rejected: {}", counts.join(" "));
    }
    for e in &report.series_errors {
        let _ = writeln!(out, "  ! {}: {}", e.series_id, e.error);
    }
    for f in &report.failures {
        let _ = writeln!(out, "  x {} {}: {} ({})", f.series_id, f.episode, f.release, f.reason);
    }
    out
}
