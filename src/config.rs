// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Configuration is read once from the environment at startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Root of every hosted identity's storage | `/data` |
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `TENANTS` | Comma-separated identities hosted by this process | required |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |
//! | `PEER_OPERATION_MAX_ATTEMPTS` | Immediate attempts per peer call | `3` |
//! | `PEER_OPERATION_DELAY_MS` | Delay between immediate attempts | `300` |
//! | `PEER_REQUEST_TIMEOUT_SECS` | HTTP timeout of one peer call | `15` |
//! | `OUTBOX_MAX_ATTEMPTS` | Outbox attempts before an item is dropped | `30` |
//! | `OUTBOX_RETRY_BASE_SECS` | First outbox backoff | `5` |
//! | `OUTBOX_RETRY_MAX_SECS` | Backoff cap | `3600` |
//! | `OUTBOX_BATCH_SIZE` | Items attempted per sweep | `100` |
//! | `OUTBOX_POLL_INTERVAL_SECS` | Seconds between sweeps | `30` |
//! | `UPLOAD_PACKAGE_TTL_SECS` | Lifetime of an unfinished upload | `3600` |
//! | `UPLOAD_PACKAGE_CAPACITY` | Open uploads kept per identity | `1024` |
//! | `PEER_ADDRESS_OVERRIDES` | `identity=url,...` routing for development | empty |

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::models::IdentityId;
use crate::transit::outbox::RetryPolicy;
use crate::transit::retry::ImmediateRetry;

pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";
pub const TENANTS_ENV: &str = "TENANTS";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";
pub const PEER_OPERATION_MAX_ATTEMPTS_ENV: &str = "PEER_OPERATION_MAX_ATTEMPTS";
pub const PEER_OPERATION_DELAY_MS_ENV: &str = "PEER_OPERATION_DELAY_MS";
pub const PEER_REQUEST_TIMEOUT_SECS_ENV: &str = "PEER_REQUEST_TIMEOUT_SECS";
pub const OUTBOX_MAX_ATTEMPTS_ENV: &str = "OUTBOX_MAX_ATTEMPTS";
pub const OUTBOX_RETRY_BASE_SECS_ENV: &str = "OUTBOX_RETRY_BASE_SECS";
pub const OUTBOX_RETRY_MAX_SECS_ENV: &str = "OUTBOX_RETRY_MAX_SECS";
pub const OUTBOX_BATCH_SIZE_ENV: &str = "OUTBOX_BATCH_SIZE";
pub const OUTBOX_POLL_INTERVAL_SECS_ENV: &str = "OUTBOX_POLL_INTERVAL_SECS";
pub const UPLOAD_PACKAGE_TTL_SECS_ENV: &str = "UPLOAD_PACKAGE_TTL_SECS";
pub const UPLOAD_PACKAGE_CAPACITY_ENV: &str = "UPLOAD_PACKAGE_CAPACITY";
pub const PEER_ADDRESS_OVERRIDES_ENV: &str = "PEER_ADDRESS_OVERRIDES";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },

    #[error("{0} must list at least one identity")]
    NoTenants(&'static str),
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub package_ttl: Duration,
    pub package_capacity: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            package_ttl: Duration::from_secs(3600),
            package_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub tenants: Vec<IdentityId>,
    pub log_format: LogFormat,
    pub immediate_retry: ImmediateRetry,
    pub peer_request_timeout: Duration,
    pub outbox_retry: RetryPolicy,
    pub outbox_batch_size: usize,
    pub outbox_poll_interval: Duration,
    pub uploads: UploadSettings,
    pub peer_address_overrides: HashMap<IdentityId, String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. `lookup` returns `None` for unset
    /// variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let tenants = parse_tenants(lookup(TENANTS_ENV).as_deref().unwrap_or_default())?;
        let peer_address_overrides = parse_overrides(lookup(PEER_ADDRESS_OVERRIDES_ENV).as_deref().unwrap_or_default())?;

        Ok(Self {
            data_dir: PathBuf::from(lookup(DATA_DIR_ENV).unwrap_or_else(|| crate::storage::paths::DATA_ROOT.to_string())),
            host: lookup(HOST_ENV).unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env_or_default(&lookup, PORT_ENV, 8080)?,
            tenants,
            log_format: env_or_default(&lookup, LOG_FORMAT_ENV, LogFormat::default())?,
            immediate_retry: ImmediateRetry {
                attempts: env_or_default(&lookup, PEER_OPERATION_MAX_ATTEMPTS_ENV, 3)?,
                delay: Duration::from_millis(env_or_default(&lookup, PEER_OPERATION_DELAY_MS_ENV, 300)?),
            },
            peer_request_timeout: Duration::from_secs(env_or_default(&lookup, PEER_REQUEST_TIMEOUT_SECS_ENV, 15)?),
            outbox_retry: RetryPolicy {
                max_attempts: env_or_default(&lookup, OUTBOX_MAX_ATTEMPTS_ENV, 30)?,
                base_delay: Duration::from_secs(env_or_default(&lookup, OUTBOX_RETRY_BASE_SECS_ENV, 5)?),
                max_delay: Duration::from_secs(env_or_default(&lookup, OUTBOX_RETRY_MAX_SECS_ENV, 3600)?),
            },
            outbox_batch_size: env_or_default(&lookup, OUTBOX_BATCH_SIZE_ENV, 100)?,
            outbox_poll_interval: Duration::from_secs(env_or_default(&lookup, OUTBOX_POLL_INTERVAL_SECS_ENV, 30)?),
            uploads: UploadSettings {
                package_ttl: Duration::from_secs(env_or_default(&lookup, UPLOAD_PACKAGE_TTL_SECS_ENV, 3600)?),
                package_capacity: env_or_default(&lookup, UPLOAD_PACKAGE_CAPACITY_ENV, 1024)?,
            },
            peer_address_overrides,
        })
    }
}

fn env_or_default<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        _ => Ok(default),
    }
}

fn parse_tenants(value: &str) -> Result<Vec<IdentityId>, ConfigError> {
    let tenants = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse().map_err(|_| ConfigError::Invalid {
                name: TENANTS_ENV,
                value: s.to_string(),
            })
        })
        .collect::<Result<Vec<IdentityId>, _>>()?;
    if tenants.is_empty() {
        return Err(ConfigError::NoTenants(TENANTS_ENV));
    }
    Ok(tenants)
}

fn parse_overrides(value: &str) -> Result<HashMap<IdentityId, String>, ConfigError> {
    let invalid = |entry: &str| ConfigError::Invalid {
        name: PEER_ADDRESS_OVERRIDES_ENV,
        value: entry.to_string(),
    };
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (identity, url) = entry.split_once('=').ok_or_else(|| invalid(entry))?;
            let identity = identity.trim().parse().map_err(|_| invalid(entry))?;
            Ok((identity, url.trim().to_string()))
        })
        .collect()
}
