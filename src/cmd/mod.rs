//! # Command module
//!
//! This module provide command line interface structures and helpers

use std::{num::NonZeroU32, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use futures::{StreamExt, TryStreamExt};
use governor::{Quota, RateLimiter};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    runtime::{reflector, watcher, WatchStreamExt},
    Api,
};
use tokio::sync::{oneshot, Notify};
use tracing::{error, info, warn};

use crate::svc::{
    cfg::Configuration,
    crd::hotstandby,
    http,
    k8s::{client, lease, recorder, Context, Watcher},
    probe,
};

pub mod crd;

// -----------------------------------------------------------------------------
// constants

/// delay granted to in-flight reconciliations on shutdown
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

// -----------------------------------------------------------------------------
// Executor trait

#[async_trait]
pub trait Executor {
    type Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error>;
}

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute command '{0}', {1}")]
    Execution(String, Arc<Error>),
    #[error("failed to execute command, {0}")]
    CustomResourceDefinition(crd::Error),
    #[error("failed to run daemon, {0}")]
    Daemon(DaemonError),
}

// -----------------------------------------------------------------------------
// Command enum

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Print the custom resource definition handled by the operator
    #[command(name = "custom-resource-definition", alias = "crd")]
    CustomResourceDefinition,
}

#[async_trait]
impl Executor for Command {
    type Error = Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::CustomResourceDefinition => crd::view(config)
                .await
                .map_err(Error::CustomResourceDefinition)
                .map_err(|err| {
                    Error::Execution("custom-resource-definition".into(), Arc::new(err))
                }),
        }
    }
}

// -----------------------------------------------------------------------------
// Args struct

#[derive(Parser, Clone, Debug)]
#[command(version, about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Args {
    /// Increase log verbosity
    #[arg(short = 'v', global = true, action = ArgAction::Count)]
    pub verbosity: u8,
    /// Set the log level, takes precedence over '-v'
    #[arg(long = "log-level", global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,
    /// Specify location of kubeconfig
    #[arg(short = 'k', long = "kubeconfig", global = true)]
    pub kubeconfig: Option<PathBuf>,
    /// Specify location of configuration
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Check if configuration is healthy
    #[arg(short = 't', long = "check", global = true)]
    pub check: bool,
    /// Watch a single namespace
    #[arg(short = 'n', long = "namespace", conflicts_with = "all_namespaces")]
    pub namespace: Option<String>,
    /// Watch every namespace
    #[arg(long = "all-namespaces")]
    pub all_namespaces: bool,
    /// Number of parallel reconciliation workers
    #[arg(long = "workers", value_name = "N")]
    pub workers: Option<u16>,
    /// Take part in a leader election before reconciling
    #[arg(long = "leader-elect")]
    pub leader_elect: bool,
    /// Number of busy probes in flight per resource
    #[arg(long = "probe-concurrency", value_name = "N")]
    pub probe_concurrency: Option<usize>,
    /// Listen address of the health and metrics endpoints
    #[arg(long = "metrics-addr", value_name = "HOST:PORT")]
    pub metrics_addr: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Args {
    /// overrides configuration values with the ones given on the command line
    pub fn apply(&self, config: &mut Configuration) {
        if self.all_namespaces {
            config.operator.namespace = None;
        }

        if let Some(namespace) = &self.namespace {
            config.operator.namespace = Some(namespace.to_owned());
        }

        if let Some(workers) = self.workers {
            config.operator.workers = workers;
        }

        if let Some(probe_concurrency) = self.probe_concurrency {
            config.operator.probe_concurrency = probe_concurrency;
        }

        if let Some(metrics_addr) = &self.metrics_addr {
            config.operator.listen = metrics_addr.to_owned();
        }

        if self.leader_elect {
            config.operator.leader_elect = true;
        }
    }
}

// -----------------------------------------------------------------------------
// DaemonError enum

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("failed to handle termination signal, {0}")]
    SigTerm(std::io::Error),
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
    #[error("failed to take part in leader election, {0}")]
    Lease(lease::Error),
    #[error("lost leadership lease, {0}")]
    LeaseLost(String),
    #[error("failed to wait for the pod informer cache to become ready, {0}")]
    Store(kube::runtime::reflector::store::WriterDropped),
}

// -----------------------------------------------------------------------------
// daemon function

pub async fn daemon(
    kubeconfig: Option<PathBuf>,
    config: Arc<Configuration>,
) -> Result<(), DaemonError> {
    // -------------------------------------------------------------------------
    // Create a new kubernetes client from path if defined, or via the
    // environment or defaults locations
    let kube_client = client::try_new(kubeconfig)
        .await
        .map_err(DaemonError::Client)?;

    // -------------------------------------------------------------------------
    // Take part in the leader election when asked to, acquisition blocks
    // until this instance holds the lease
    let mut lease_lost = None;

    if config.operator.leader_elect {
        let elector = lease::Elector::new(
            kube_client.to_owned(),
            &config.lease.namespace,
            lease::LEASE_NAME,
            config.lease.duration,
        )
        .map_err(DaemonError::Lease)?;

        info!(
            identity = elector.identity(),
            "Waiting to acquire the leadership lease"
        );
        elector.acquire().await.map_err(DaemonError::Lease)?;
        info!(
            identity = elector.identity(),
            "Acquired the leadership lease"
        );

        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let _ = tx.send(elector.hold().await);
        });

        lease_lost = Some(rx);
    }

    // -------------------------------------------------------------------------
    // Start the pod informer cache shared by the probe engine and the
    // reconciler
    let pods_api: Api<Pod> = match &config.operator.namespace {
        Some(namespace) => Api::namespaced(kube_client.to_owned(), namespace),
        None => Api::all(kube_client.to_owned()),
    };
    let (pods, writer) = reflector::store();
    let mut pod_stream = reflector(
        writer,
        watcher(pods_api, watcher::Config::default()).default_backoff(),
    )
    .applied_objects()
    .boxed();

    let pod_reflector = tokio::spawn(async move {
        loop {
            match pod_stream.try_next().await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        "Pod informer stream returned an error"
                    );
                }
            }
        }
    });

    info!("Waiting for the pod informer cache to become ready");
    pods.wait_until_ready().await.map_err(DaemonError::Store)?;

    // -------------------------------------------------------------------------
    // Create the context given to each reconciler
    let shutdown = Arc::new(Notify::new());
    let limiter = Arc::new(RateLimiter::direct(
        Quota::per_second(
            NonZeroU32::new(config.api.query_per_second.max(1))
                .expect("a non zero query per second budget"),
        )
        .allow_burst(NonZeroU32::new(config.api.burst.max(1)).expect("a non zero burst budget")),
    ));
    let probes = Arc::new(probe::Engine::new(
        pods.to_owned(),
        config.operator.probe_concurrency,
    ));
    let event_recorder = recorder::Recorder::new(kube_client.to_owned(), limiter.to_owned());
    let context = Arc::new(Context::new(
        kube_client,
        pods,
        probes,
        event_recorder,
        limiter,
        shutdown.to_owned(),
        config.to_owned(),
    ));

    // -------------------------------------------------------------------------
    // Create the reconciler
    let watcher_context = context.to_owned();
    let mut reconciler_handle = tokio::spawn(async move {
        let reconciler = hotstandby::Reconciler::default();

        info!("Start to listen for events of hot-standby custom resource");
        if let Err(err) = reconciler.watch(watcher_context).await {
            error!(
                error = err.to_string(),
                "Could not reconcile hot-standby custom resource"
            );
        }
    });

    // -------------------------------------------------------------------------
    // Create http server
    let server_config = config.to_owned();
    let server = tokio::spawn(async move {
        if let Err(err) = http::serve(server_config).await {
            error!(error = err.to_string(), "Could not serve http server");
        }
    });

    // -------------------------------------------------------------------------
    // Wait for a termination signal or the loss of the leadership lease
    let lost = match lease_lost {
        Some(rx) => {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res.map_err(DaemonError::SigTerm)?;
                    None
                }
                err = rx => Some(match err {
                    Ok(err) => err.to_string(),
                    Err(_) => "lease holder task stopped".to_string(),
                }),
            }
        }
        None => {
            tokio::signal::ctrl_c()
                .await
                .map_err(DaemonError::SigTerm)?;
            None
        }
    };

    // -------------------------------------------------------------------------
    // Drain in-flight reconciliations, then abort the remaining tasks
    info!("Shutting down, draining in-flight reconciliations");
    shutdown.notify_waiters();

    if tokio::time::timeout(DRAIN_TIMEOUT, &mut reconciler_handle)
        .await
        .is_err()
    {
        warn!(
            drain = DRAIN_TIMEOUT.as_secs(),
            "Reconciler did not drain in time, aborting it"
        );
        reconciler_handle.abort();
    }

    for handle in [pod_reflector, server] {
        handle.abort();
        if let Err(err) = handle.await {
            if !err.is_cancelled() {
                error!(
                    error = err.to_string(),
                    "Could not wait for the task to complete"
                );
            }
        }
    }

    if let Some(holder) = lost {
        return Err(DaemonError::LeaseLost(holder));
    }

    Ok(())
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> Args {
        Args {
            verbosity: 0,
            log_level: None,
            kubeconfig: None,
            config: None,
            check: false,
            namespace: None,
            all_namespaces: false,
            workers: None,
            leader_elect: false,
            probe_concurrency: None,
            metrics_addr: None,
            command: None,
        }
    }

    fn configuration() -> Configuration {
        use crate::svc::cfg::{Api, Lease, Operator};

        Configuration {
            operator: Operator {
                listen: "0.0.0.0:8000".to_string(),
                namespace: Some("default".to_string()),
                workers: 2,
                probe_concurrency: 16,
                requeue_interval: 30,
                leader_elect: false,
            },
            api: Api {
                query_per_second: 20,
                burst: 40,
            },
            lease: Lease {
                namespace: "default".to_string(),
                duration: 30,
            },
        }
    }

    #[test]
    fn apply_should_override_configuration_with_flags() {
        let mut config = configuration();
        let mut args = args();

        args.workers = Some(4);
        args.metrics_addr = Some("127.0.0.1:9100".to_string());
        args.leader_elect = true;
        args.apply(&mut config);

        assert_eq!(4, config.operator.workers);
        assert_eq!("127.0.0.1:9100", config.operator.listen);
        assert!(config.operator.leader_elect);
        assert_eq!(Some("default".to_string()), config.operator.namespace);
    }

    #[test]
    fn apply_should_widen_the_namespace_scope() {
        let mut config = configuration();
        let mut widen = args();

        widen.all_namespaces = true;
        widen.apply(&mut config);
        assert_eq!(None, config.operator.namespace);

        let mut config = configuration();
        let mut narrow = args();

        narrow.namespace = Some("game".to_string());
        narrow.apply(&mut config);
        assert_eq!(Some("game".to_string()), config.operator.namespace);
    }
}
