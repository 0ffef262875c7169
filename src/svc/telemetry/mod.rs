//! # Telemetry module
//!
//! This module expose telemetry measurements, mainly health and metrics
//! endpoints served over http

use std::collections::BTreeMap;
use std::time::Instant;

use hyper::{
    header::{self, HeaderValue},
    Body, Method, Request, Response, StatusCode,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{gather, opts, register_counter_vec, CounterVec, Encoder, TextEncoder};
use tracing::info;

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static SERVER_REQUEST_SUCCESS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_server_request_success",
            "number of successful request handled by the server",
        ),
        &["method", "path", "status"]
    )
    .expect("metrics 'kubernetes_operator_server_request_success' to not be already registered")
});

#[cfg(feature = "metrics")]
static SERVER_REQUEST_FAILURE: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_server_request_failure",
            "number of failed request handled by the server",
        ),
        &["method", "path", "status"]
    )
    .expect("metrics 'kubernetes_operator_server_request_failure' to not be already registered")
});

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[cfg(feature = "metrics")]
    #[error("failed to serialize metrics, {0}")]
    PrometheusSerialize(prometheus::Error),
    #[cfg(feature = "metrics")]
    #[error("failed to parse header value given by prometheus, {0}")]
    PrometheusInvalidHeader(hyper::header::InvalidHeaderValue),
    #[error("failed to serialize payload, {0}")]
    Serialize(serde_json::Error),
}

// -----------------------------------------------------------------------------
// Helper methods

pub async fn router(req: Request<Body>) -> Result<Response<Body>, Error> {
    let begin = Instant::now();

    let result = match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => healthz(&req).await,
        #[cfg(feature = "metrics")]
        (&Method::GET, "/metrics") => metrics(&req).await,
        _ => not_found(&req).await,
    };

    let duration = Instant::now().duration_since(begin).as_micros();

    match result {
        Ok(res) => {
            info!(
                method = req.method().as_str(),
                path = req.uri().path(),
                status = res.status().as_u16(),
                duration = format!("{}us", duration),
                "receive request",
            );

            #[cfg(feature = "metrics")]
            SERVER_REQUEST_SUCCESS
                .with_label_values(&[
                    req.method().as_str(),
                    req.uri().path(),
                    &res.status().as_u16().to_string(),
                ])
                .inc();

            Ok(res)
        }
        Err(err) => {
            let mut map = BTreeMap::new();

            map.insert("error".to_string(), err.to_string());

            let mut res = Response::default();

            res.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );

            *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            *res.body_mut() =
                Body::from(serde_json::to_string_pretty(&map).map_err(Error::Serialize)?);

            info!(
                method = req.method().as_str(),
                path = req.uri().path(),
                status = res.status().as_u16(),
                duration = format!("{}us", duration),
                "receive request",
            );

            #[cfg(feature = "metrics")]
            SERVER_REQUEST_FAILURE
                .with_label_values(&[
                    req.method().as_str(),
                    req.uri().path(),
                    &res.status().as_u16().to_string(),
                ])
                .inc();

            Ok(res)
        }
    }
}

pub async fn healthz(_req: &Request<Body>) -> Result<Response<Body>, Error> {
    let mut res = Response::default();

    *res.status_mut() = StatusCode::NO_CONTENT;

    Ok(res)
}

#[cfg(feature = "metrics")]
/// returns in the [`Response`] object the encoded metrics gathered from the
/// application
pub async fn metrics(_req: &Request<Body>) -> Result<Response<Body>, Error> {
    let families = gather();
    let encoder = TextEncoder;
    let mut buf = vec![];

    encoder
        .encode(&families, &mut buf)
        .map_err(Error::PrometheusSerialize)?;

    let mut res = Response::default();

    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(encoder.format_type()).map_err(Error::PrometheusInvalidHeader)?,
    );

    *res.status_mut() = StatusCode::OK;
    *res.body_mut() = Body::from(buf);

    Ok(res)
}

pub async fn not_found(_req: &Request<Body>) -> Result<Response<Body>, Error> {
    let mut res = Response::default();

    *res.status_mut() = StatusCode::NOT_FOUND;

    Ok(res)
}
