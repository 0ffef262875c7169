//! # Hot-standby operator
//!
//! A kubernetes operator that maintains a constant buffer of idle replicas
//! for a workload by reconciling hot-standby custom resources

use std::{convert::TryFrom, process::ExitCode, sync::Arc};

use clap::Parser;
use tracing::{error, info};

use crate::{
    cmd::{daemon, Args, DaemonError, Executor},
    svc::cfg::Configuration,
};

pub mod cmd;
pub mod logging;
pub mod svc;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to interact with command line interface, {0}")]
    Command(cmd::Error),
    #[error("failed to initialize logging system, {0}")]
    Logging(logging::Error),
    #[error("failed to load configuration, {0}")]
    Configuration(svc::cfg::Error),
}

impl From<cmd::Error> for Error {
    fn from(err: cmd::Error) -> Self {
        Self::Command(err)
    }
}

impl From<logging::Error> for Error {
    fn from(err: logging::Error) -> Self {
        Self::Logging(err)
    }
}

impl From<svc::cfg::Error> for Error {
    fn from(err: svc::cfg::Error) -> Self {
        Self::Configuration(err)
    }
}

// -----------------------------------------------------------------------------
// main entrypoint

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match execute(&args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(Error::Command(cmd::Error::Daemon(DaemonError::LeaseLost(holder)))) => {
            error!(holder = holder, "{} lost its leadership lease", env!("CARGO_PKG_NAME"));
            ExitCode::from(2)
        }
        Err(err) => {
            error!(
                error = err.to_string(),
                "could not execute {} properly",
                env!("CARGO_PKG_NAME"),
            );
            ExitCode::FAILURE
        }
    }
}

async fn execute(args: &Args) -> Result<(), Error> {
    let mut config = match &args.config {
        Some(path) => Configuration::try_from(path.to_owned())?,
        None => Configuration::try_default()?,
    };

    args.apply(&mut config);

    let config = Arc::new(config);

    logging::initialize(logging::resolve(args.verbosity, args.log_level.as_deref())?)?;
    config.help();

    if args.check {
        println!("{} configuration is healthy!", env!("CARGO_PKG_NAME"));
        return Ok(());
    }

    match &args.command {
        Some(cmd) => cmd.execute(config).await?,
        None => daemon(args.kubeconfig.to_owned(), config)
            .await
            .map_err(cmd::Error::Daemon)?,
    }

    info!("{} halted!", env!("CARGO_PKG_NAME"));
    Ok(())
}
