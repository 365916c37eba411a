//! Release matching: decides which listing candidates fill which local gaps.
//!
//! Everything here is a pure function of its inputs. Given the same series,
//! known episodes, candidates (in the same order) and policy, the decisions
//! are identical.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::library::models::{EpisodeNumber, Series};
use crate::library::parser::{normalize_alias, parse_season_number, resolution_rank, tokens};
use crate::nyaa::RemoteCandidate;

/// Why a candidate was not accepted. Ordinary filtering outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Unparsable,
    TitleMismatch,
    AlreadyHave,
    BelowFloor,
    UntrustedGroup,
    /// Lost the tie-break to another trusted release of the same episode
    Superseded,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Unparsable => "unparsable",
            RejectReason::TitleMismatch => "title_mismatch",
            RejectReason::AlreadyHave => "already_have",
            RejectReason::BelowFloor => "below_floor",
            RejectReason::UntrustedGroup => "untrusted_group",
            RejectReason::Superseded => "superseded",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject(RejectReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchDecision {
    pub candidate: RemoteCandidate,
    pub decision: Decision,
}

/// Tie-break criteria among trusted releases of the same episode, applied in
/// the configured order. Listing order always decides last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Earlier in `trust.group_priority` wins; no-op when that list is empty
    GroupPriority,
    /// Higher vertical resolution wins; unknown resolution ranks lowest
    Resolution,
}

/// Immutable trust and tie-break settings, built once from the config
#[derive(Debug, Clone, Default)]
pub struct MatchPolicy {
    trusted: BTreeSet<String>,
    group_priority: Vec<String>,
    tie_break: Vec<TieBreak>,
}

fn normalize_group(group: &str) -> String {
    group.trim().to_lowercase()
}

impl MatchPolicy {
    pub fn new(trusted: &[String], group_priority: &[String], tie_break: Vec<TieBreak>) -> Self {
        Self {
            trusted: trusted
                .iter()
                .map(|g| normalize_group(g))
                .filter(|g| !g.is_empty())
                .collect(),
            group_priority: group_priority.iter().map(|g| normalize_group(g)).collect(),
            tie_break,
        }
    }

    /// Releases without a group prefix are never trusted
    pub fn is_trusted(&self, group: Option<&str>) -> bool {
        group.is_some_and(|g| self.trusted.contains(&normalize_group(g)))
    }

    fn priority_of(&self, group: Option<&str>) -> usize {
        group
            .map(normalize_group)
            .and_then(|g| self.group_priority.iter().position(|p| *p == g))
            .unwrap_or(usize::MAX)
    }

    /// `Less` means `a` is preferred over `b`
    fn prefer(&self, a: &RemoteCandidate, b: &RemoteCandidate) -> Ordering {
        for criterion in &self.tie_break {
            let ord = match criterion {
                TieBreak::GroupPriority => self
                    .priority_of(a.group.as_deref())
                    .cmp(&self.priority_of(b.group.as_deref())),
                TieBreak::Resolution => resolution_rank(b.resolution.as_deref())
                    .cmp(&resolution_rank(a.resolution.as_deref())),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.position.cmp(&b.position)
    }
}

/// Season of a title, with "no marker" meaning the first season
fn season_of(title: &str) -> u32 {
    parse_season_number(title).unwrap_or(1)
}

/// Alias check against the series part of a release title: a case-insensitive
/// substring, or every alias token present. Both sides must name the same
/// season so sequels with overlapping tokens do not collide.
pub fn title_matches(aliases: &[String], series_title: &str) -> bool {
    let title = normalize_alias(series_title);
    let title_tokens: BTreeSet<String> = tokens(series_title).into_iter().collect();
    let title_season = season_of(series_title);

    aliases.iter().any(|alias| {
        let alias = normalize_alias(alias);
        let alias_tokens = tokens(&alias);
        let hit = (!alias.is_empty() && title.contains(&alias))
            || (!alias_tokens.is_empty() && alias_tokens.iter().all(|t| title_tokens.contains(t)));
        hit && season_of(&alias) == title_season
    })
}

/// Decide every candidate for one series.
///
/// Filters run in order (unparsable, title mismatch, already present, below
/// the series floor, untrusted group); survivors are grouped by episode and
/// exactly one per episode is accepted. The result keeps listing order.
pub fn match_releases(
    series: &Series,
    known: &BTreeSet<EpisodeNumber>,
    candidates: Vec<RemoteCandidate>,
    policy: &MatchPolicy,
) -> Vec<MatchDecision> {
    let mut decisions: Vec<MatchDecision> = candidates
        .into_iter()
        .map(|candidate| {
            let decision = match pre_filter(series, known, &candidate, policy) {
                Some(reason) => Decision::Reject(reason),
                None => Decision::Accept,
            };
            MatchDecision {
                candidate,
                decision,
            }
        })
        .collect();

    let mut by_episode: BTreeMap<EpisodeNumber, Vec<usize>> = BTreeMap::new();
    for (idx, d) in decisions.iter().enumerate() {
        if let (Decision::Accept, Some(episode)) = (d.decision, d.candidate.episode) {
            by_episode.entry(episode).or_default().push(idx);
        }
    }

    for indices in by_episode.values() {
        let Some(&winner) = indices.iter().min_by(|&&a, &&b| {
            policy.prefer(&decisions[a].candidate, &decisions[b].candidate)
        }) else {
            continue;
        };
        for &idx in indices {
            if idx != winner {
                decisions[idx].decision = Decision::Reject(RejectReason::Superseded);
            }
        }
    }

    decisions
}

fn pre_filter(
    series: &Series,
    known: &BTreeSet<EpisodeNumber>,
    candidate: &RemoteCandidate,
    policy: &MatchPolicy,
) -> Option<RejectReason> {
    let (Some(episode), Some(series_title)) = (candidate.episode, &candidate.series_title) else {
        return Some(RejectReason::Unparsable);
    };
    if !title_matches(&series.aliases, series_title) {
        return Some(RejectReason::TitleMismatch);
    }
    if known.contains(&episode) {
        return Some(RejectReason::AlreadyHave);
    }
    if series.min_episode.is_some_and(|floor| episode < floor) {
        return Some(RejectReason::BelowFloor);
    }
    if !policy.is_trusted(candidate.group.as_deref()) {
        return Some(RejectReason::UntrustedGroup);
    }
    None
}
