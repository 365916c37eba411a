use regex::Regex;
use std::sync::LazyLock;

use super::models::EpisodeNumber;

static GROUP_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\[([^\]]+)\]\s*").unwrap());

static EPISODE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        // Show Name - 01 [1080p], Show Name - 12.5 (720p), Show - 05v2 END [1080p]
        Regex::new(r"^(.*?)\s+-\s+(\d{1,4}(?:\.\d{1,2})?)(?:v\d+)?(?:\s|\[|\(|\.|$)").unwrap(),
        // S01E01 format (common for western naming)
        Regex::new(r"^(.*?)[\s._-]*[Ss]\d{1,2}[Ee](\d{1,4})(?:v\d+)?(?:[\s._\[\(-]|$)").unwrap(),
        // Episode 01, Ep 01, EP01
        Regex::new(r"(?i)^(.*?)[\s._-]+Ep(?:isode)?[\s._]*(\d{1,4})(?:v\d+)?(?:[\s._\[\(-]|$)")
            .unwrap(),
    ]
});

// Ranges and season packs. Any of these make a title unparsable.
static BATCH_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)\bbatch\b").unwrap(),
        Regex::new(r"(?i)\bcomplete\b").unwrap(),
        // 01-12, 01~12, 01 ~ 12
        Regex::new(r"\b\d{1,4}(?:-|\s*~\s*)\d{1,4}\b").unwrap(),
    ]
});

static SEASON_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        // S01E05, S02 (common in anime releases like "Show S02 - 05")
        Regex::new(r"(?i)\bS(\d{1,2})(?:\s*E\d|\b)").unwrap(),
        // "Season 2", "Season 01"
        Regex::new(r"(?i)\bSeason\s*(\d{1,2})\b").unwrap(),
        // "2nd Season", "3rd Season"
        Regex::new(r"(?i)\b(\d{1,2})(?:st|nd|rd|th)\s+Season\b").unwrap(),
        // "Part 2", "Cour 2"
        Regex::new(r"(?i)\b(?:Part|Cour)\s*(\d{1,2})\b").unwrap(),
    ]
});

static RESOLUTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b((?:360|480|540|576|720|1080|1440|2160)p|4k)\b").unwrap());

/// Group name used for releases without a bracketed prefix. Never trusted.
pub const UNKNOWN_GROUP: &str = "unknown";

/// Structured view of a release title or local file name
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRelease {
    /// Bracketed group prefix, if any
    pub group: Option<String>,
    /// Series part of the title (between the group and the episode marker)
    pub title: String,
    pub episode: EpisodeNumber,
    pub resolution: Option<String>,
}

impl ParsedRelease {
    pub fn group_name(&self) -> &str {
        self.group.as_deref().unwrap_or(UNKNOWN_GROUP)
    }
}

pub fn parse_release_group(title: &str) -> Option<String> {
    GROUP_PREFIX
        .captures(title)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|g| !g.is_empty())
}

pub fn parse_resolution(title: &str) -> Option<String> {
    RESOLUTION
        .captures(title)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
}

/// Vertical pixel count for ordering resolutions; unknown sorts lowest
pub fn resolution_rank(resolution: Option<&str>) -> u32 {
    match resolution {
        Some("4k") => 2160,
        Some(r) => r.trim_end_matches('p').parse().unwrap_or(0),
        None => 0,
    }
}

pub fn is_batch_title(title: &str) -> bool {
    BATCH_PATTERNS.iter().any(|re| re.is_match(title))
}

/// Parse a release title like `[Group] Title - 07 [1080p]`.
///
/// Returns `None` for titles without a single recognizable episode number,
/// including batches and ranges such as `01-12`.
pub fn parse_release(raw: &str) -> Option<ParsedRelease> {
    let group = parse_release_group(raw);
    let rest = match GROUP_PREFIX.find(raw) {
        Some(m) => &raw[m.end()..],
        None => raw.trim_start(),
    };

    if is_batch_title(rest) {
        return None;
    }

    for pattern in EPISODE_PATTERNS.iter() {
        let Some(caps) = pattern.captures(rest) else {
            continue;
        };
        let (Some(title), Some(number)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let title = make_show_title(title.as_str());
        if title.is_empty() {
            continue;
        }
        let Ok(episode) = number.as_str().parse::<EpisodeNumber>() else {
            continue;
        };

        return Some(ParsedRelease {
            group,
            title,
            episode,
            resolution: parse_resolution(rest),
        });
    }
    None
}

pub fn parse_season_number(title: &str) -> Option<u32> {
    for pattern in SEASON_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(title) {
            if let Some(num_match) = caps.get(1) {
                if let Ok(num) = num_match.as_str().parse::<u32>() {
                    if num > 0 && num < 100 {
                        return Some(num);
                    }
                }
            }
        }
    }
    None
}

pub fn is_video_file(filename: &str, extensions: &[String]) -> bool {
    let lower = filename.to_lowercase();
    extensions
        .iter()
        .any(|ext| lower.ends_with(&format!(".{}", ext.to_lowercase())))
}

/// Parse a local file name; the extension must be one of `extensions`
pub fn parse_episode_file(filename: &str, extensions: &[String]) -> Option<ParsedRelease> {
    if !is_video_file(filename, extensions) {
        return None;
    }
    let stem = filename.rsplit_once('.').map(|(stem, _)| stem)?;
    parse_release(stem)
}

pub fn make_series_id(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

pub fn make_show_title(name: &str) -> String {
    name.replace('_', " ")
        .replace('.', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(|c: char| c == '-' || c == ':' || c.is_whitespace())
        .to_string()
}

/// Lowercase and collapse whitespace
pub fn normalize_alias(alias: &str) -> String {
    alias
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Lowercase alphanumeric tokens
pub fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Filesystem-safe directory or file name derived from a title
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').to_string();
    if cleaned.is_empty() {
        "untitled".to_string()
    } else {
        cleaned
    }
}
