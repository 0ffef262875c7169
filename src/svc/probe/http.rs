//! # Http probe module
//!
//! Periodic strategy of the busy probe: every period the poller issues a GET
//! request against each selected pod and interprets the response status per
//! the `successIsBusy` switch. A failed probe preserves the previous busy
//! value of the pod and records the error.

use std::{collections::BTreeMap, hash::Hasher, sync::Arc, time::Duration};

use chrono::Utc;
use fnv::FnvHasher;
use futures::StreamExt;
use hyper::{client::HttpConnector, Uri};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::Store;
use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, trace};

use crate::svc::{
    crd::hotstandby::HttpProbe,
    probe::{self, Entry, PodKey, Table},
};

// -----------------------------------------------------------------------------
// Helpers functions

/// returns the busy value of a probe response, an exclusive-nor between the
/// response success and the `successIsBusy` switch
pub fn interpret(success: bool, success_is_busy: bool) -> bool {
    success == success_is_busy
}

/// returns a stable start offset of up to a tenth of the period, so pollers
/// of distinct resources do not fire in lockstep
pub fn jitter(key: &str, period: Duration) -> Duration {
    let max = (period / 10).as_millis() as u64;

    if max == 0 {
        return Duration::ZERO;
    }

    let mut hasher = FnvHasher::default();

    hasher.write(key.as_bytes());
    Duration::from_millis(hasher.finish() % max)
}

/// returns whether the `Ready` condition of the pod is reported as false
pub fn ready_condition_false(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "False")
        })
        .unwrap_or(false)
}

/// returns the identity and ip of a pod eligible for probing
pub(crate) fn eligible(pod: &Pod) -> Option<(PodKey, String)> {
    let key = PodKey::try_from_pod(pod)?;
    let ip = pod.status.as_ref()?.pod_ip.to_owned()?;

    if ready_condition_false(pod) {
        return None;
    }

    Some((key, ip))
}

/// fold a probe outcome into the table, a failure preserves the previous busy
/// value and a pod without history is idle
pub(crate) fn apply(
    table: &mut Table,
    key: PodKey,
    outcome: Result<bool, String>,
    success_is_busy: bool,
) {
    let now = Utc::now();

    match outcome {
        Ok(success) => {
            table.entries.insert(
                key,
                Entry {
                    busy: interpret(success, success_is_busy),
                    last_observed: now,
                    last_probe_error: None,
                },
            );
        }
        Err(error) => {
            let busy = table
                .entries
                .get(&key)
                .map(|entry| entry.busy)
                .unwrap_or(false);

            table.entries.insert(
                key,
                Entry {
                    busy,
                    last_observed: now,
                    last_probe_error: Some(error),
                },
            );
        }
    }
}

/// issue a single GET request against the pod, a 2xx status is a success and
/// anything else including connection failures and timeouts is a failure
async fn request(
    client: &hyper::Client<HttpConnector>,
    ip: &str,
    probe: &HttpProbe,
) -> Result<bool, String> {
    let authority = if ip.contains(':') {
        format!("[{}]:{}", ip, probe.port)
    } else {
        format!("{}:{}", ip, probe.port)
    };

    let uri: Uri = format!("http://{}{}", authority, probe.path)
        .parse()
        .map_err(|err: hyper::http::uri::InvalidUri| err.to_string())?;

    let timeout = Duration::from_secs(u64::from(probe.timeout_seconds));

    match tokio::time::timeout(timeout, client.get(uri)).await {
        Ok(Ok(response)) => Ok(response.status().is_success()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err(format!(
            "probe timed out after {}s",
            probe.timeout_seconds
        )),
    }
}

/// probe every eligible selected pod with bounded concurrency and stamp the
/// table once the sweep completed
pub(crate) async fn poll_once(
    client: &hyper::Client<HttpConnector>,
    pods: &Store<Pod>,
    namespace: &str,
    selector: &BTreeMap<String, String>,
    probe: &HttpProbe,
    table: &Arc<Mutex<Table>>,
    concurrency: usize,
) {
    let targets = probe::select_pods(pods, namespace, selector)
        .iter()
        .filter_map(|pod| eligible(pod))
        .collect::<Vec<_>>();

    futures::stream::iter(targets)
        .for_each_concurrent(concurrency.max(1), |(key, ip)| async move {
            let outcome = request(client, &ip, probe).await;

            if let Err(error) = &outcome {
                debug!(
                    pod = key.name.as_str(),
                    ip = ip.as_str(),
                    error = error.as_str(),
                    "Busy probe request failed for pod",
                );
            }

            apply(
                &mut *table.lock().await,
                key,
                outcome,
                probe.success_is_busy,
            );
        })
        .await;

    table.lock().await.as_of = Utc::now();
}

/// spawn the periodic poller of one resource
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn(
    pods: Store<Pod>,
    client: hyper::Client<HttpConnector>,
    key: String,
    namespace: String,
    selector: BTreeMap<String, String>,
    probe: HttpProbe,
    table: Arc<Mutex<Table>>,
    concurrency: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(u64::from(probe.period_seconds.max(1)));

        tokio::time::sleep(jitter(&key, period)).await;

        let mut ticker = tokio::time::interval(period);

        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            poll_once(
                &client,
                &pods,
                &namespace,
                &selector,
                &probe,
                &table,
                concurrency,
            )
            .await;

            trace!(key = key.as_str(), "Completed busy probe sweep for resource");
        }
    })
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::probe::tests::pod;

    fn key(name: &str) -> PodKey {
        PodKey {
            namespace: "default".to_string(),
            name: name.to_string(),
            uid: format!("uid-{}", name),
        }
    }

    #[test]
    fn interpret_should_be_an_exclusive_nor() {
        assert!(interpret(true, true));
        assert!(!interpret(false, true));
        assert!(!interpret(true, false));
        assert!(interpret(false, false));
    }

    #[test]
    fn jitter_should_stay_under_a_tenth_of_the_period() {
        let period = Duration::from_secs(10);

        for name in ["default/a", "default/b", "kube-system/c"] {
            assert!(jitter(name, period) < period / 10);
        }

        assert_eq!(Duration::ZERO, jitter("default/a", Duration::from_millis(5)));
        assert_eq!(jitter("default/a", period), jitter("default/a", period));
    }

    #[test]
    fn apply_should_preserve_busy_on_failure() {
        let mut table = Table::new();

        apply(&mut table, key("a"), Ok(true), true);
        assert!(table.entries[&key("a")].busy);
        assert!(table.entries[&key("a")].last_probe_error.is_none());

        apply(&mut table, key("a"), Err("timeout".to_string()), true);
        assert!(table.entries[&key("a")].busy);
        assert_eq!(
            Some("timeout".to_string()),
            table.entries[&key("a")].last_probe_error
        );
    }

    #[test]
    fn apply_should_mark_unknown_pods_idle_on_first_failure() {
        let mut table = Table::new();

        apply(&mut table, key("a"), Err("connection refused".to_string()), true);
        assert!(!table.entries[&key("a")].busy);
        assert!(table.entries[&key("a")].last_probe_error.is_some());
    }

    #[test]
    fn apply_should_honor_the_success_is_busy_switch() {
        let mut table = Table::new();

        apply(&mut table, key("a"), Ok(true), false);
        assert!(!table.entries[&key("a")].busy);

        apply(&mut table, key("b"), Ok(false), false);
        assert!(table.entries[&key("b")].busy);
    }

    #[test]
    fn eligible_should_skip_pods_without_ip_or_not_ready() {
        let mut with_ip = pod("a", &[], &[], Some("Running"));

        with_ip.status.as_mut().expect("pod to have a status").pod_ip =
            Some("10.0.0.12".to_string());
        assert!(eligible(&with_ip).is_some());

        let without_ip = pod("b", &[], &[], Some("Running"));
        assert!(eligible(&without_ip).is_none());

        let mut not_ready = with_ip.to_owned();

        not_ready
            .status
            .as_mut()
            .expect("pod to have a status")
            .conditions = Some(vec![k8s_openapi::api::core::v1::PodCondition {
            type_: "Ready".to_string(),
            status: "False".to_string(),
            ..Default::default()
        }]);
        assert!(eligible(&not_ready).is_none());
    }
}
