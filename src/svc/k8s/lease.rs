//! # Lease module
//!
//! This module provide a lease based leader election, so at most one operator
//! instance mutates resources at a time. Losing the lease triggers a graceful
//! stop of the process.

use std::{io, time::Duration};

use chrono::{DateTime, Utc};
use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::MicroTime,
};
use kube::{
    api::{ObjectMeta, PostParams},
    Api, Client,
};
use tracing::{debug, info, warn};

// -----------------------------------------------------------------------------
// constants

pub const LEASE_NAME: &str = "hotstandby-operator";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to retrieve hostname to use as lease identity, {0}")]
    Hostname(io::Error),
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("lease '{0}' is now held by '{1}'")]
    Lost(String, String),
}

// -----------------------------------------------------------------------------
// Elector structure

pub struct Elector {
    api: Api<Lease>,
    name: String,
    identity: String,
    duration: i64,
}

impl Elector {
    pub fn new(client: Client, namespace: &str, name: &str, duration: i64) -> Result<Self, Error> {
        let identity = hostname::get()
            .map_err(Error::Hostname)?
            .to_string_lossy()
            .to_string();

        Ok(Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            identity,
            duration: duration.max(1),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// block until the lease is acquired
    pub async fn acquire(&self) -> Result<(), Error> {
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    return Ok(());
                }
                Ok(false) => {
                    debug!(
                        name = self.name.as_str(),
                        identity = self.identity.as_str(),
                        "Lease is held by another instance, standing by",
                    );
                }
                Err(err) => {
                    warn!(
                        name = self.name.as_str(),
                        error = err.to_string(),
                        "Failed to acquire lease, will retry",
                    );
                }
            }

            tokio::time::sleep(self.renew_interval()).await;
        }
    }

    /// renew the lease until it is lost, the returned error carries the new
    /// holder
    pub async fn hold(&self) -> Error {
        loop {
            tokio::time::sleep(self.renew_interval()).await;

            match self.try_acquire().await {
                Ok(true) => {}
                Ok(false) => {
                    let holder = match self.api.get(&self.name).await {
                        Ok(lease) => holder_identity(&lease).unwrap_or_default(),
                        Err(_) => String::new(),
                    };

                    return Error::Lost(self.name.to_owned(), holder);
                }
                Err(err) => {
                    // transient api failures are tolerated as long as the
                    // lease itself could still be ours, the next tick retries
                    warn!(
                        name = self.name.as_str(),
                        error = err.to_string(),
                        "Failed to renew lease, will retry",
                    );
                }
            }
        }
    }

    /// create, renew or take over the lease, returns whether we hold it
    async fn try_acquire(&self) -> Result<bool, Error> {
        let now = Utc::now();
        let lease = match self.api.get_opt(&self.name).await.map_err(Error::KubeClient)? {
            None => {
                let lease = self.materialize(None, now, 0);

                return match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => {
                        info!(
                            name = self.name.as_str(),
                            identity = self.identity.as_str(),
                            "Created leadership lease",
                        );
                        Ok(true)
                    }
                    Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
                    Err(err) => Err(Error::KubeClient(err)),
                };
            }
            Some(lease) => lease,
        };

        let ours = holder_identity(&lease).as_deref() == Some(self.identity.as_str());

        if !ours && !expired(&lease, now) {
            return Ok(false);
        }

        let transitions = lease
            .spec
            .as_ref()
            .and_then(|spec| spec.lease_transitions)
            .unwrap_or(0)
            + i32::from(!ours);
        let renewed = self.materialize(Some(&lease), now, transitions);

        match self
            .api
            .replace(&self.name, &PostParams::default(), &renewed)
            .await
        {
            Ok(_) => Ok(true),
            // optimistic concurrency lost against another instance
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
            Err(err) => Err(Error::KubeClient(err)),
        }
    }

    fn renew_interval(&self) -> Duration {
        Duration::from_secs((self.duration as u64 / 3).max(1))
    }

    fn materialize(&self, current: Option<&Lease>, now: DateTime<Utc>, transitions: i32) -> Lease {
        let acquire_time = match current {
            Some(lease) if holder_identity(lease).as_deref() == Some(self.identity.as_str()) => {
                lease
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.acquire_time.to_owned())
            }
            _ => Some(MicroTime(now)),
        };

        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.to_owned()),
                resource_version: current.and_then(|lease| lease.metadata.resource_version.to_owned()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.to_owned()),
                lease_duration_seconds: Some(self.duration as i32),
                acquire_time,
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
            }),
        }
    }
}

// -----------------------------------------------------------------------------
// Helpers functions

fn holder_identity(lease: &Lease) -> Option<String> {
    lease
        .spec
        .as_ref()
        .and_then(|spec| spec.holder_identity.to_owned())
}

/// returns whether the lease expired at the given instant
fn expired(lease: &Lease, now: DateTime<Utc>) -> bool {
    let Some(spec) = lease.spec.as_ref() else {
        return true;
    };
    let Some(MicroTime(renew_time)) = spec.renew_time.to_owned() else {
        return true;
    };
    let duration = chrono::Duration::seconds(i64::from(spec.lease_duration_seconds.unwrap_or(0)));

    renew_time + duration < now
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder: Option<&str>, renewed_seconds_ago: i64, duration: i32) -> Lease {
        Lease {
            metadata: ObjectMeta::default(),
            spec: Some(LeaseSpec {
                holder_identity: holder.map(str::to_string),
                lease_duration_seconds: Some(duration),
                acquire_time: None,
                renew_time: Some(MicroTime(
                    Utc::now() - chrono::Duration::seconds(renewed_seconds_ago),
                )),
                lease_transitions: Some(0),
            }),
        }
    }

    #[test]
    fn expired_should_compare_renew_time_and_duration() {
        let now = Utc::now();

        assert!(!expired(&lease(Some("a"), 10, 30), now));
        assert!(expired(&lease(Some("a"), 40, 30), now));
    }

    #[test]
    fn expired_should_treat_missing_fields_as_expired() {
        let now = Utc::now();

        assert!(expired(
            &Lease {
                metadata: ObjectMeta::default(),
                spec: None,
            },
            now
        ));

        let mut bare = lease(Some("a"), 0, 30);

        bare.spec.as_mut().unwrap().renew_time = None;
        assert!(expired(&bare, now));
    }
}
