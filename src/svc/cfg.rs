//! # Configuration module
//!
//! This module provide utilities and helpers to interact with the configuration

use std::{
    convert::TryFrom,
    env::{self, VarError},
    path::PathBuf,
};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// -----------------------------------------------------------------------------
// Constants

pub const OPERATOR_LISTEN: &str = "0.0.0.0:8000";
pub const OPERATOR_WORKERS: i64 = 2;
pub const OPERATOR_PROBE_CONCURRENCY: i64 = 16;
pub const OPERATOR_REQUEUE_INTERVAL: i64 = 30;
pub const API_QUERY_PER_SECOND: i64 = 20;
pub const API_BURST: i64 = 40;
pub const LEASE_NAMESPACE: &str = "default";
pub const LEASE_DURATION: i64 = 30;

// -----------------------------------------------------------------------------
// Operator structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Operator {
    #[serde(rename = "listen")]
    pub listen: String,
    /// namespace to watch, every namespace when unset
    #[serde(rename = "namespace", default)]
    pub namespace: Option<String>,
    #[serde(rename = "workers")]
    pub workers: u16,
    #[serde(rename = "probeConcurrency")]
    pub probe_concurrency: usize,
    /// closing requeue interval of the reconciliation loop, in seconds
    #[serde(rename = "requeueInterval")]
    pub requeue_interval: u64,
    #[serde(rename = "leaderElect", default)]
    pub leader_elect: bool,
}

// -----------------------------------------------------------------------------
// Api structure

/// budget applied to write requests issued to the kubernetes api
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Api {
    #[serde(rename = "queryPerSecond")]
    pub query_per_second: u32,
    #[serde(rename = "burst")]
    pub burst: u32,
}

// -----------------------------------------------------------------------------
// Lease structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Lease {
    #[serde(rename = "namespace")]
    pub namespace: String,
    #[serde(rename = "duration")]
    pub duration: i64,
}

// -----------------------------------------------------------------------------
// ConfigurationError enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load configuration, {0}")]
    Build(ConfigError),
    #[error("failed to deserialize configuration, {0}")]
    Deserialize(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
    #[error("failed to retrieve environment variable '{0}', {1}")]
    EnvironmentVariable(&'static str, VarError),
}

// -----------------------------------------------------------------------------
// Configuration structures

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Configuration {
    #[serde(rename = "operator")]
    pub operator: Operator,
    #[serde(rename = "api")]
    pub api: Api,
    #[serde(rename = "lease")]
    pub lease: Lease,
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        defaults(Config::builder())?
            .add_source(Environment::with_prefix(
                &env!("CARGO_PKG_NAME").replace('-', "_"),
            ))
            .add_source(File::from(path).required(true))
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Deserialize)
    }
}

impl Configuration {
    pub fn try_default() -> Result<Self, Error> {
        defaults(Config::builder())?
            .add_source(Environment::with_prefix(
                &env!("CARGO_PKG_NAME").replace('-', "_"),
            ))
            .add_source(
                File::from(PathBuf::from(format!(
                    "/usr/share/{}/config",
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(
                File::from(PathBuf::from(format!(
                    "/etc/{}/config",
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(
                File::from(PathBuf::from(format!(
                    "{}/.config/{}/config",
                    env::var("HOME").map_err(|err| Error::EnvironmentVariable("HOME", err))?,
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(
                File::from(PathBuf::from(format!(
                    "{}/.local/share/{}/config",
                    env::var("HOME").map_err(|err| Error::EnvironmentVariable("HOME", err))?,
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(File::from(PathBuf::from("config")).required(false))
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Deserialize)
    }

    /// Prints messages about build flags and odd configuration values
    pub fn help(&self) {
        #[cfg(feature = "metrics")]
        info!("Build with 'metrics' feature flag");

        if self.operator.workers == 0 {
            warn!("Configuration key 'operator.workers' is 0, no reconciliation will happen");
        }

        if self.api.query_per_second == 0 || self.api.burst == 0 {
            warn!("Configuration keys 'api.queryPerSecond' and 'api.burst' must be greater than 0, writes will stall");
        }

        match &self.operator.namespace {
            Some(namespace) => info!(
                namespace = namespace.as_str(),
                "Watching a single namespace"
            ),
            None => info!("Watching every namespace"),
        }
    }
}

fn defaults(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<config::ConfigBuilder<config::builder::DefaultState>, Error> {
    builder
        .set_default("operator.listen", OPERATOR_LISTEN)
        .map_err(|err| Error::Default("operator.listen".into(), err))?
        .set_default("operator.workers", OPERATOR_WORKERS)
        .map_err(|err| Error::Default("operator.workers".into(), err))?
        .set_default("operator.probeConcurrency", OPERATOR_PROBE_CONCURRENCY)
        .map_err(|err| Error::Default("operator.probeConcurrency".into(), err))?
        .set_default("operator.requeueInterval", OPERATOR_REQUEUE_INTERVAL)
        .map_err(|err| Error::Default("operator.requeueInterval".into(), err))?
        .set_default("api.queryPerSecond", API_QUERY_PER_SECOND)
        .map_err(|err| Error::Default("api.queryPerSecond".into(), err))?
        .set_default("api.burst", API_BURST)
        .map_err(|err| Error::Default("api.burst".into(), err))?
        .set_default("lease.namespace", LEASE_NAMESPACE)
        .map_err(|err| Error::Default("lease.namespace".into(), err))?
        .set_default("lease.duration", LEASE_DURATION)
        .map_err(|err| Error::Default("lease.duration".into(), err))
}
