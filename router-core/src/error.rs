//! Typed errors for the library-level components.
//!
//! Call sites wrap these with `anyhow::Context` when propagating out of
//! `main`; the variants here exist so tests and callers can match on the
//! failure kind instead of parsing a message string.

use thiserror::Error;

/// Failures from parsing a PSX `Variables.txt`-format catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("invalid line: {0}")]
    InvalidLine(String),
    #[error("duplicate keyword {0} in catalog data")]
    DuplicateKeyword(String),
    #[error("unknown network mode {mode} for {keyword}")]
    UnknownMode { keyword: String, mode: String },
    #[error("invalid integer value in line: {0}")]
    InvalidInteger(String),
    #[error("keyword {0} is missing a Mode/Min/Max field")]
    IncompleteDefinition(String),
}

/// Failures from the keyword cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache has no value for keyword {0}")]
    Uncached(String),
    #[error("wrong data type for keyword {keyword}: {value}")]
    WrongType { keyword: String, value: String },
}

/// Failures from loading and validating `RouterConfig`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("the listen port must be a valid port number")]
    InvalidListenPort,
    #[error("an access rule must have a display_name")]
    MissingDisplayName,
    #[error("an access rule must use match_password or match_ipv4")]
    MissingAccessMatcher,
    #[error("invalid IPv4 network in access rule: {0}")]
    InvalidNetwork(String),
    #[error("empty password in access rule, remove the line for no-password access")]
    EmptyPassword,
    #[error("access rule level must be one of full, observer, blocked: got {0}")]
    InvalidAccessLevel(String),
    #[error("check type must be one of is_frankenrouter, name_regexp: got {0}")]
    InvalidCheckType(String),
    #[error("invalid regexp in [[check]] entry: {0}")]
    InvalidCheckRegexp(String),
}
