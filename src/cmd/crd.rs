//! # Custom resource definition module
//!
//! This module provides custom resource module command line interface function
//! implementation

use std::sync::Arc;

use kube::CustomResourceExt;

use crate::svc::{cfg::Configuration, crd::hotstandby::HotStandbyDeployment};

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize custom resource definition, {0}")]
    Serialize(serde_yaml::Error),
}

// -----------------------------------------------------------------------------
// view function

pub async fn view(_config: Arc<Configuration>) -> Result<(), Error> {
    let crd = serde_yaml::to_string(&HotStandbyDeployment::crd()).map_err(Error::Serialize)?;

    print!("{}", crd);
    Ok(())
}
