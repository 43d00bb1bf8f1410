//! Resolves how many virtual endpoints should exist.
//!
//! The settings file is a plain `key=value` file, typically shared with other programs.
//! Only one key is looked at (`gps_port` by default).
//! Its value is either a non-negative integer or a case-insensitive `false`.
//!
//! Nothing in here is fatal.
//! A missing file, a missing key or garbage in the value all degrade to a fallback,
//! which is then shaped by a [`FallbackPolicy`].

use std::{fmt::Display, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// The default key looked up in the settings file.
pub const DEFAULT_KEY: &str = "gps_port";

/// The token which explicitly disables the fanout.
const DISABLE_TOKEN: &str = "false";

/// Why the settings could not be used as-is.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SettingsProblem {
    /// The settings file does not exist.
    #[error("settings file not found")]
    MissingFile,

    /// The settings file exists but could not be read.
    #[error("settings file unreadable: {0}")]
    Unreadable(String),

    /// The file was read but the key was not in it.
    #[error("key `{0}` not found")]
    MissingKey(String),

    /// The key was found but the value is neither a count nor a disable token.
    #[error("value `{0}` is neither a non-negative integer nor `false`")]
    BadValue(String),
}

/// What to do when the settings can not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FallbackPolicy {
    /// Treat the fanout as disabled.
    #[default]
    Disable,

    /// Run with this many endpoints anyway.
    DefaultCount(u32),
}

/// The outcome of looking at the settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Explicitly opted out, either via `false` or `0`.
    Disabled,

    /// A positive count was configured.
    Enabled(u32),

    /// The settings were unusable and the policy says to not run.
    FallbackDisabled(SettingsProblem),

    /// The settings were unusable and the policy says to run with a default count.
    FallbackEnabled {
        /// The count decided by policy.
        count: u32,

        /// Why the fallback was taken.
        problem: SettingsProblem,
    },
}

impl Resolution {
    /// How many endpoints to run, if any.
    pub fn endpoint_count(&self) -> Option<u32> {
        match self {
            Resolution::Enabled(count) | Resolution::FallbackEnabled { count, .. } => {
                Some(*count).filter(|count| *count > 0)
            }
            Resolution::Disabled | Resolution::FallbackDisabled(_) => None,
        }
    }

    /// Did the settings have a problem which forced a fallback?
    pub fn problem(&self) -> Option<&SettingsProblem> {
        match self {
            Resolution::FallbackDisabled(problem) | Resolution::FallbackEnabled { problem, .. } => {
                Some(problem)
            }
            _ => None,
        }
    }

    /// Log this resolution.
    /// Fallbacks are warnings, a deliberate opt-out is not.
    pub fn log(&self) {
        match self {
            Resolution::Disabled => info!("Fanout disabled via settings"),
            Resolution::Enabled(count) => info!(%count, "Fanout enabled via settings"),
            Resolution::FallbackDisabled(problem) => {
                warn!(%problem, "Settings unusable, fanout disabled as fallback")
            }
            Resolution::FallbackEnabled { count, problem } => {
                warn!(%problem, %count, "Settings unusable, using fallback endpoint count")
            }
        }
    }
}

impl Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::Disabled => write!(f, "disabled"),
            Resolution::Enabled(count) => write!(f, "enabled ({count})"),
            Resolution::FallbackDisabled(problem) => write!(f, "disabled (fallback: {problem})"),
            Resolution::FallbackEnabled { count, problem } => {
                write!(f, "enabled ({count}, fallback: {problem})")
            }
        }
    }
}

/// What the raw value said, before any policy is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Lookup {
    Disabled,
    Count(u32),
}

/// Find `key` in `key=value` text.
///
/// Blank lines, `#`/`;` comments and `[section]` headers are skipped.
/// The first matching key wins.
pub fn find_value<'a>(contents: &'a str, key: &str) -> Option<&'a str> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with('#') && !line.starts_with(';') && !line.starts_with('['))
        .filter_map(|line| line.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, value)| value.trim())
}

fn interpret(value: &str) -> Result<Lookup, SettingsProblem> {
    if value.eq_ignore_ascii_case(DISABLE_TOKEN) {
        return Ok(Lookup::Disabled);
    }

    match value.parse::<u32>() {
        Ok(0) => Ok(Lookup::Disabled),
        Ok(count) => Ok(Lookup::Count(count)),
        Err(_) => Err(SettingsProblem::BadValue(value.to_owned())),
    }
}

fn apply(policy: FallbackPolicy, lookup: Result<Lookup, SettingsProblem>) -> Resolution {
    match (lookup, policy) {
        (Ok(Lookup::Disabled), _) => Resolution::Disabled,
        (Ok(Lookup::Count(count)), _) => Resolution::Enabled(count),
        (Err(problem), FallbackPolicy::Disable) => Resolution::FallbackDisabled(problem),
        (Err(problem), FallbackPolicy::DefaultCount(0)) => Resolution::FallbackDisabled(problem),
        (Err(problem), FallbackPolicy::DefaultCount(count)) => {
            Resolution::FallbackEnabled { count, problem }
        }
    }
}

/// Resolve settings from text already in memory.
pub fn resolve_str(contents: &str, key: &str, policy: FallbackPolicy) -> Resolution {
    let lookup = find_value(contents, key)
        .ok_or_else(|| SettingsProblem::MissingKey(key.to_owned()))
        .and_then(interpret);

    apply(policy, lookup)
}

/// Resolve settings from a file.
pub fn resolve<P: AsRef<Path>>(path: P, key: &str, policy: FallbackPolicy) -> Resolution {
    let path = path.as_ref();
    debug!(?path, %key, "Resolving endpoint count");

    match std::fs::read_to_string(path) {
        Ok(contents) => resolve_str(&contents, key, policy),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            apply(policy, Err(SettingsProblem::MissingFile))
        }
        Err(e) => apply(policy, Err(SettingsProblem::Unreadable(e.to_string()))),
    }
}

/// An example settings file.
pub fn example() -> String {
    format!("# How many virtual GPS ports to create, or `false` to disable.\n{DEFAULT_KEY}=4\n")
}
