//! # HTTP module
//!
//! This module provide the http server exposing health and metrics endpoints

use std::{net::AddrParseError, sync::Arc};

use hyper::{
    service::{make_service_fn, service_fn},
    Server,
};
use tracing::info;

use crate::svc::{cfg::Configuration, telemetry};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse listen address '{0}', {1}")]
    Listen(String, AddrParseError),
    #[error("failed to bind server, {0}")]
    Bind(hyper::Error),
    #[error("failed to serve content, {0}")]
    Serve(hyper::Error),
}

// -----------------------------------------------------------------------------
// Helpers functions

pub async fn serve(config: Arc<Configuration>) -> Result<(), Error> {
    let addr = config
        .operator
        .listen
        .parse()
        .map_err(|err| Error::Listen(config.operator.listen.to_owned(), err))?;

    info!("Start to listen for http request on {}", addr);
    Server::try_bind(&addr)
        .map_err(Error::Bind)?
        .serve(make_service_fn(|_| async {
            Ok::<_, telemetry::Error>(service_fn(telemetry::router))
        }))
        .await
        .map_err(Error::Serve)?;

    Ok(())
}
