//! Configuration errors.
//!
//! Bad input data is never an error here: it becomes a quality flag on the
//! output record. Only a broken strategy table stops the engine from starting.

use thiserror::Error;

/// Problems found while loading or validating a `StrategyRegistry`
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("No profile registered for {0}")]
    MissingProfile(String),

    #[error("Profile registered under '{key}' declares type '{declared}'")]
    MismatchedProfile { key: String, declared: String },

    #[error("Invalid pattern '{pattern}' for {owner}: {source}")]
    InvalidPattern {
        owner: String,
        pattern: String,
        source: regex::Error,
    },

    #[error("Duplicate rule for field '{field}' in {owner}")]
    DuplicateField { owner: String, field: String },

    #[error("Field '{field}' in {owner} reads '{reference}' before it is resolved")]
    ForwardReference {
        owner: String,
        field: String,
        reference: String,
    },

    #[error("Field '{field}' in {owner} uses unknown {kind} '{name}'")]
    UnknownTable {
        owner: String,
        field: String,
        kind: &'static str,
        name: String,
    },

    #[error("{owner} references field '{field}' that no rule produces")]
    UnknownField { owner: String, field: String },

    #[error("Quality grid in {owner} must list levels from best to worst")]
    UnorderedQualityGrid { owner: String },

    #[error("Scorecard '{scorecard}' in {owner} has negative weight for '{component}'")]
    NegativeWeight {
        owner: String,
        scorecard: String,
        component: String,
    },
}
