use crate::errors::{FaultError, Result};
use http::header::HeaderName;
use http::HeaderMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Header rule as it appears in the filter configuration file.
///
/// Exactly one of the match fields may be set. With none set the rule only
/// requires the header to be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderMatcherConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact_match: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex_match: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_match: Option<RangeMatch>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub present_match: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_match: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix_match: Option<String>,

    #[serde(default)]
    pub invert_match: bool,
}

/// Half-open integer range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeMatch {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone)]
enum MatchKind {
    Present,
    Exact(String),
    Regex(Regex),
    Range(RangeMatch),
    PresentAs(bool),
    Prefix(String),
    Suffix(String),
}

/// Compiled header predicate.
#[derive(Debug, Clone)]
pub struct HeaderMatcher {
    name: HeaderName,
    kind: MatchKind,
    invert: bool,
}

impl HeaderMatcher {
    pub fn from_config(config: &HeaderMatcherConfig) -> Result<Self> {
        let name = HeaderName::from_bytes(config.name.to_ascii_lowercase().as_bytes())
            .map_err(|e| {
                FaultError::InvalidHeaderMatcher(format!(
                    "invalid header name '{}': {}",
                    config.name, e
                ))
            })?;

        let set = [
            config.exact_match.is_some(),
            config.regex_match.is_some(),
            config.range_match.is_some(),
            config.present_match.is_some(),
            config.prefix_match.is_some(),
            config.suffix_match.is_some(),
        ]
        .iter()
        .filter(|s| **s)
        .count();
        if set > 1 {
            return Err(FaultError::InvalidHeaderMatcher(format!(
                "header '{}' sets more than one match type",
                config.name
            )));
        }

        let kind = if let Some(value) = &config.exact_match {
            MatchKind::Exact(value.clone())
        } else if let Some(pattern) = &config.regex_match {
            // Anchored: the whole header value must match.
            let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
                FaultError::InvalidHeaderMatcher(format!(
                    "bad regex for header '{}': {}",
                    config.name, e
                ))
            })?;
            MatchKind::Regex(regex)
        } else if let Some(range) = config.range_match {
            if range.start >= range.end {
                return Err(FaultError::InvalidHeaderMatcher(format!(
                    "empty range [{}, {}) for header '{}'",
                    range.start, range.end, config.name
                )));
            }
            MatchKind::Range(range)
        } else if let Some(present) = config.present_match {
            MatchKind::PresentAs(present)
        } else if let Some(prefix) = &config.prefix_match {
            if prefix.is_empty() {
                return Err(FaultError::InvalidHeaderMatcher(format!(
                    "empty prefix for header '{}'",
                    config.name
                )));
            }
            MatchKind::Prefix(prefix.clone())
        } else if let Some(suffix) = &config.suffix_match {
            if suffix.is_empty() {
                return Err(FaultError::InvalidHeaderMatcher(format!(
                    "empty suffix for header '{}'",
                    config.name
                )));
            }
            MatchKind::Suffix(suffix.clone())
        } else {
            MatchKind::Present
        };

        Ok(Self {
            name,
            kind,
            invert: config.invert_match,
        })
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn matches(&self, headers: &HeaderMap) -> bool {
        let value = headers
            .get(&self.name)
            .and_then(|v| v.to_str().ok());

        let matched = match (&self.kind, value) {
            (MatchKind::PresentAs(expected), v) => v.is_some() == *expected,
            // Every other kind needs the header to exist.
            (_, None) => false,
            (MatchKind::Present, Some(_)) => true,
            (MatchKind::Exact(expected), Some(v)) => v == expected,
            (MatchKind::Regex(regex), Some(v)) => regex.is_match(v),
            (MatchKind::Range(range), Some(v)) => v
                .trim()
                .parse::<i64>()
                .map(|n| n >= range.start && n < range.end)
                .unwrap_or(false),
            (MatchKind::Prefix(prefix), Some(v)) => v.starts_with(prefix.as_str()),
            (MatchKind::Suffix(suffix), Some(v)) => v.ends_with(suffix.as_str()),
        };

        matched != self.invert
    }
}

/// True iff every matcher accepts the headers. An empty list always matches.
pub fn match_all(matchers: &[HeaderMatcher], headers: &HeaderMap) -> bool {
    matchers.iter().all(|m| m.matches(headers))
}
