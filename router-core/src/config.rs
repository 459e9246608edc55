//! Router configuration.
//!
//! Config is loaded once at startup from a TOML file and validated before
//! any socket opens. Defaults mirror a zero-config first run: an empty
//! `[[access]]` table grants `full` access to everyone, matching the
//! original router's interactive-first-run fallback.

use std::net::IpAddr;
use std::path::Path;

use anyhow::Context;
use ipnet::IpNet;
use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub simulator: String,
    pub router: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            simulator: "Unknown Sim".to_string(),
            router: "Unknown Router".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub port: u16,
    pub rest_api_port: Option<u16>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            port: 10748,
            rest_api_port: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub interactive: bool,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            interactive: false,
            host: "127.0.0.1".to_string(),
            port: 10747,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub traffic: bool,
    pub directory: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            traffic: false,
            directory: ".".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PsxConfig {
    pub variables: String,
    pub filter_flight_controls: bool,
    pub filter_elevation: bool,
    pub filter_traffic: bool,
}

impl Default for PsxConfig {
    fn default() -> Self {
        Self {
            variables: "Variables.txt".to_string(),
            filter_flight_controls: false,
            filter_elevation: false,
            filter_traffic: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilteringConfig {
    pub tiller: bool,
    pub tiller_smallest_movement: i64,
    pub tiller_center: i64,
}

impl Default for FilteringConfig {
    fn default() -> Self {
        Self {
            tiller: false,
            tiller_smallest_movement: 2,
            tiller_center: 800,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub write_buffer_warning: usize,
    pub queue_time_warning: f64,
    pub total_delay_warning: f64,
    pub monitor_delay_warning: f64,
    pub frdp_rtt_warning: f64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            write_buffer_warning: 100_000,
            queue_time_warning: 0.016,
            total_delay_warning: 0.024,
            monitor_delay_warning: 0.032,
            frdp_rtt_warning: 0.1,
        }
    }
}

/// Which of two linked routers is the authority for `sharedinfo` (e.g.
/// `pilot_flying_simulator`) when both report it. Resolved dynamically by
/// UUID comparison if a conflict is observed (see `rules::handle_sharedinfo`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SharedinfoConfig {
    pub master: bool,
}

impl Default for SharedinfoConfig {
    fn default() -> Self {
        Self { master: false }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessRuleRaw {
    pub display_name: Option<String>,
    #[serde(default)]
    pub match_ipv4: Vec<String>,
    pub is_frankenrouter: Option<bool>,
    pub match_password: Option<String>,
    pub level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AccessRule {
    pub display_name: String,
    pub match_ipv4: Vec<IpNet>,
    pub is_frankenrouter: Option<bool>,
    pub match_password: Option<String>,
    pub level: String,
}

impl AccessRule {
    fn from_raw(raw: AccessRuleRaw) -> anyhow::Result<Self> {
        let display_name = raw.display_name.ok_or(ConfigError::MissingDisplayName)?;
        if raw.match_ipv4.is_empty() && raw.match_password.is_none() {
            anyhow::bail!(ConfigError::MissingAccessMatcher);
        }
        let mut match_ipv4 = Vec::with_capacity(raw.match_ipv4.len());
        for entry in &raw.match_ipv4 {
            if entry == "ANY" {
                match_ipv4.push("0.0.0.0/0".parse().unwrap());
                continue;
            }
            let net: IpNet = entry
                .parse()
                .map_err(|_| ConfigError::InvalidNetwork(entry.clone()))?;
            match_ipv4.push(net);
        }
        if let Some(pw) = &raw.match_password {
            if pw.is_empty() {
                anyhow::bail!(ConfigError::EmptyPassword);
            }
        }
        let level = raw
            .level
            .ok_or_else(|| ConfigError::InvalidAccessLevel("<missing>".into()))?;
        if !matches!(level.as_str(), "full" | "observer" | "blocked") {
            anyhow::bail!(ConfigError::InvalidAccessLevel(level));
        }
        Ok(Self {
            display_name,
            match_ipv4,
            is_frankenrouter: raw.is_frankenrouter,
            match_password: raw.match_password,
            level,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckRuleRaw {
    #[serde(rename = "type")]
    pub checktype: String,
    pub regexp: Option<String>,
    pub limit_min: Option<u32>,
    pub limit_max: Option<u32>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CheckRule {
    pub checktype: String,
    pub regexp: Option<regex::Regex>,
    pub limit_min: Option<u32>,
    pub limit_max: Option<u32>,
    pub comment: Option<String>,
}

impl CheckRule {
    fn from_raw(raw: CheckRuleRaw) -> anyhow::Result<Self> {
        if !matches!(raw.checktype.as_str(), "is_frankenrouter" | "name_regexp") {
            anyhow::bail!(ConfigError::InvalidCheckType(raw.checktype));
        }
        let regexp = match &raw.regexp {
            Some(pattern) => Some(
                regex::Regex::new(pattern)
                    .map_err(|_| ConfigError::InvalidCheckRegexp(pattern.clone()))?,
            ),
            None => None,
        };
        Ok(Self {
            checktype: raw.checktype,
            regexp,
            limit_min: raw.limit_min,
            limit_max: raw.limit_max,
            comment: raw.comment,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    identity: IdentityConfig,
    #[serde(default)]
    listen: ListenConfig,
    #[serde(default)]
    upstream: UpstreamConfig,
    #[serde(default)]
    log: LogConfig,
    #[serde(default)]
    psx: PsxConfig,
    #[serde(default)]
    filtering: FilteringConfig,
    #[serde(default)]
    performance: PerformanceConfig,
    #[serde(default)]
    sharedinfo: SharedinfoConfig,
    #[serde(default)]
    access: Vec<AccessRuleRaw>,
    #[serde(default)]
    check: Vec<CheckRuleRaw>,
}

/// Fully validated router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub identity: IdentityConfig,
    pub listen: ListenConfig,
    pub upstream: UpstreamConfig,
    pub log: LogConfig,
    pub psx: PsxConfig,
    pub filtering: FilteringConfig,
    pub performance: PerformanceConfig,
    pub sharedinfo: SharedinfoConfig,
    pub access: Vec<AccessRule>,
    pub check: Vec<CheckRule>,
}

impl RouterConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_str(&content)
    }

    pub fn from_str(data: &str) -> anyhow::Result<Self> {
        let raw: RawConfig = toml::from_str(data).context("parsing config TOML")?;

        let mut access = Vec::with_capacity(raw.access.len());
        for entry in raw.access {
            access.push(AccessRule::from_raw(entry)?);
        }
        if access.is_empty() {
            tracing::info!("no [[access]] section in config, allowing all clients to connect");
            access.push(AccessRule {
                display_name: "all clients allowed".to_string(),
                match_ipv4: vec!["0.0.0.0/0".parse().unwrap()],
                is_frankenrouter: None,
                match_password: None,
                level: "full".to_string(),
            });
        }

        let mut check = Vec::with_capacity(raw.check.len());
        for entry in raw.check {
            check.push(CheckRule::from_raw(entry)?);
        }

        let config = Self {
            identity: raw.identity,
            listen: raw.listen,
            upstream: raw.upstream,
            log: raw.log,
            psx: raw.psx,
            filtering: raw.filtering,
            performance: raw.performance,
            sharedinfo: raw.sharedinfo,
            access,
            check,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !Path::new(&self.log.directory).exists() {
            anyhow::bail!("log directory {} does not exist", self.log.directory);
        }
        Ok(())
    }
}

pub fn ip_in_any(ip: IpAddr, nets: &[IpNet]) -> bool {
    nets.iter().any(|n| n.contains(&ip))
}
