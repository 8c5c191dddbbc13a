//! Per-path feature checks resolved by regex.

use enumset::{EnumSet, EnumSetType};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfigError;

/// Optional per-path features.
#[derive(Debug, EnumSetType)]
pub enum Check {
    /// Report standard deviation, skewness and kurtosis for stats paths.
    Moments,
    /// Report the most frequent sample for stats paths.
    Mode,
    /// Run a linear predictor on adder paths.
    Predict,
}

/// The set of checks enabled for a record.
pub type Checks = EnumSet<Check>;

/// Configuration of a whitelist/blacklist pair of regexes.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MatchConfig {
    /// Paths must match one of these to be selected.
    ///
    /// A pattern starting with `!` selects paths that do *not* match the rest of the pattern.
    pub whitelist: Vec<String>,

    /// Paths matching any of these are never selected.
    pub blacklist: Vec<String>,

    /// Decides for every path when both lists are empty.
    ///
    /// Defaults to `false`.
    pub fallback_match: bool,
}

#[derive(Debug)]
struct Pattern {
    regex: Regex,
    negate: bool,
}

/// An ordered list of compiled patterns.
#[derive(Debug, Default)]
pub struct RegexList {
    patterns: Vec<Pattern>,
}

impl RegexList {
    /// Compiles a list of patterns.
    pub fn new<I, S>(patterns: I) -> Result<Self, EngineConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                let (negate, source) = match pattern.strip_prefix('!') {
                    Some(rest) => (true, rest),
                    None => (false, pattern),
                };

                Regex::new(source)
                    .map(|regex| Pattern { regex, negate })
                    .map_err(|source| EngineConfigError::InvalidRegex {
                        pattern: pattern.to_owned(),
                        source,
                    })
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { patterns })
    }

    /// Returns `true` if there are no patterns.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns `true` if any pattern selects `path`.
    pub fn is_match(&self, path: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| p.regex.is_match(path) != p.negate)
    }
}

/// A compiled [`MatchConfig`].
#[derive(Debug, Default)]
pub struct PathMatcher {
    whitelist: RegexList,
    blacklist: RegexList,
    fallback: bool,
}

impl PathMatcher {
    /// Compiles the regex lists of a match configuration.
    pub fn new(config: &MatchConfig) -> Result<Self, EngineConfigError> {
        Ok(Self {
            whitelist: RegexList::new(&config.whitelist)?,
            blacklist: RegexList::new(&config.blacklist)?,
            fallback: config.fallback_match,
        })
    }

    /// A matcher that selects every path.
    pub fn all() -> Self {
        Self {
            fallback: true,
            ..Default::default()
        }
    }

    /// Returns `true` if `path` is selected.
    ///
    /// The blacklist wins over the whitelist. An empty whitelist selects everything not
    /// blacklisted, unless both lists are empty, in which case the fallback decides.
    pub fn is_match(&self, path: &str) -> bool {
        if self.whitelist.is_empty() && self.blacklist.is_empty() {
            return self.fallback;
        }

        if self.blacklist.is_match(path) {
            return false;
        }

        self.whitelist.is_empty() || self.whitelist.is_match(path)
    }
}
