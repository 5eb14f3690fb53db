//! Capability matching: interests evaluated against token attributes.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::RoutingError;

/// Selection criteria keyed by attribute name.
pub type SelectionCriteria = BTreeMap<String, Interest>;

/// A matching rule on one attribute.
///
/// The pattern must match the whole attribute value. Required interests
/// disqualify a token when they fail; optional ones only raise its score.
#[derive(Clone)]
pub struct Interest {
    source: String,
    matcher: Matcher,
    required: bool,
}

#[derive(Clone)]
enum Matcher {
    Literal(String),
    Pattern(Regex),
}

impl Interest {
    /// Build an interest from a regular expression.
    pub fn regex(pattern: &str, required: bool) -> Result<Self, regex::Error> {
        let anchored = Regex::new(&format!("^(?:{pattern})$"))?;
        Ok(Self {
            source: pattern.to_string(),
            matcher: Matcher::Pattern(anchored),
            required,
        })
    }

    /// Build an interest matching exactly `value`.
    ///
    /// The pattern reported for it is the escaped literal, so it reads
    /// back as an equivalent regex interest.
    pub fn exact(value: &str, required: bool) -> Self {
        Self {
            source: regex::escape(value),
            matcher: Matcher::Literal(value.to_string()),
            required,
        }
    }

    /// Required interest from a pattern, reporting bad patterns as routing errors.
    pub fn required(key: &str, pattern: &str) -> Result<Self, RoutingError> {
        Self::regex(pattern, true).map_err(|e| RoutingError::InvalidCriteria {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.source
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn matches(&self, value: &str) -> bool {
        match &self.matcher {
            Matcher::Literal(literal) => literal == value,
            Matcher::Pattern(pattern) => pattern.is_match(value),
        }
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interest")
            .field("pattern", &self.source)
            .field("required", &self.required)
            .finish()
    }
}

impl PartialEq for Interest {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.required == other.required
    }
}

#[derive(Serialize, Deserialize)]
struct InterestRepr {
    pattern: String,
    #[serde(default = "default_required")]
    required: bool,
}

fn default_required() -> bool {
    true
}

impl Serialize for Interest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        InterestRepr {
            pattern: self.source.clone(),
            required: self.required,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Interest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = InterestRepr::deserialize(deserializer)?;
        Interest::regex(&repr.pattern, repr.required).map_err(serde::de::Error::custom)
    }
}

/// Score `attributes` against `criteria`.
///
/// Returns `None` when a required interest fails (a missing attribute is a
/// failure), otherwise the number of satisfied optional interests.
pub fn affinity_score(
    criteria: &SelectionCriteria,
    attributes: &BTreeMap<String, String>,
) -> Option<usize> {
    let mut score = 0;
    for (key, interest) in criteria {
        let matched = attributes
            .get(key)
            .is_some_and(|value| interest.matches(value));
        match (matched, interest.required) {
            (false, true) => return None,
            (true, false) => score += 1,
            _ => {}
        }
    }
    Some(score)
}

/// Human readable rendering used in error messages and logs.
pub fn describe(criteria: &SelectionCriteria) -> String {
    let parts: Vec<String> = criteria
        .iter()
        .map(|(k, i)| {
            let marker = if i.required { "" } else { "?" };
            format!("{k}{marker}={}", i.source)
        })
        .collect();
    format!("{{{}}}", parts.join(", "))
}
