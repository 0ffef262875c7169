//! # Services module
//!
//! This module provide services to interact with kubernetes and helpers to do
//! so.

pub mod cfg;
pub mod crd;
pub mod http;
pub mod k8s;
pub mod probe;
pub mod telemetry;
