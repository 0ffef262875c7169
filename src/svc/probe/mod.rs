//! # Probe module
//!
//! This module maintains the busy state table of each hot-standby custom
//! resource. Two interchangeable strategies feed the table: the annotation
//! strategy derives it from the pod informer cache, the http strategy runs a
//! periodic poller against each selected pod. The reconciler only ever reads
//! a point-in-time [`Snapshot`] of the table.

use std::{
    collections::{HashMap, HashSet},
    hash::Hasher,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use fnv::FnvHasher;
use hyper::client::HttpConnector;
use k8s_openapi::api::core::v1::Pod;
use kube::{runtime::reflector::Store, ResourceExt};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::debug;

use crate::svc::crd::hotstandby::{HotStandbyDeployment, ProbeMode};

pub mod annotation;
pub mod http;

// -----------------------------------------------------------------------------
// constants

pub const DEFAULT_ANNOTATION_KEY: &str = "paia.tech/busy";
pub const BUSY_VALUE: &str = "true";

// -----------------------------------------------------------------------------
// Helpers functions

/// returns the table key of a namespaced resource
pub fn key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// returns whether the given labels satisfy the selector, an empty selector
/// matches nothing
pub fn selector_matches(
    selector: &std::collections::BTreeMap<String, String>,
    labels: &std::collections::BTreeMap<String, String>,
) -> bool {
    !selector.is_empty()
        && selector
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
}

/// returns whether the pod reached a terminal phase
pub fn terminal(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|status| status.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

/// returns the pods of the informer cache participating in the busy and idle
/// counts: in the given namespace, matching the selector, not terminal and
/// not marked for deletion
pub fn select_pods(
    pods: &Store<Pod>,
    namespace: &str,
    selector: &std::collections::BTreeMap<String, String>,
) -> Vec<Arc<Pod>> {
    pods.state()
        .into_iter()
        .filter(|pod| {
            pod.metadata.namespace.as_deref() == Some(namespace)
                && pod.metadata.deletion_timestamp.is_none()
                && !terminal(pod)
                && selector_matches(selector, pod.labels())
        })
        .collect()
}

// -----------------------------------------------------------------------------
// PodKey structure

/// identity of a pod within a busy state table
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl PodKey {
    pub fn try_from_pod(pod: &Pod) -> Option<Self> {
        Some(Self {
            namespace: pod.namespace()?,
            name: pod.metadata.name.to_owned()?,
            uid: pod.uid()?,
        })
    }
}

// -----------------------------------------------------------------------------
// Entry structure

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Entry {
    pub busy: bool,
    pub last_observed: DateTime<Utc>,
    pub last_probe_error: Option<String>,
}

// -----------------------------------------------------------------------------
// Snapshot structure

/// consistent point-in-time copy of the busy state table of one resource
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub entries: HashMap<PodKey, Entry>,
    pub as_of: DateTime<Utc>,
}

impl Snapshot {
    /// returns the number of selected pods whose busy state is known to be
    /// true, pods without an entry count as idle
    pub fn busy_count(&self, selected: &[Arc<Pod>]) -> i32 {
        selected
            .iter()
            .filter_map(|pod| PodKey::try_from_pod(pod))
            .filter(|key| self.entries.get(key).map(|entry| entry.busy).unwrap_or(false))
            .count() as i32
    }

    /// returns the number of entries carrying a probe error
    pub fn probe_errors(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.last_probe_error.is_some())
            .count()
    }

    /// returns whether the snapshot is older than the given age
    pub fn stale(&self, max_age: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.as_of);

        chrono::Duration::from_std(max_age)
            .map(|max_age| age > max_age)
            .unwrap_or(false)
    }
}

// -----------------------------------------------------------------------------
// Table structure

/// busy state table of one resource, guarded by the prober mutex
#[derive(Debug)]
pub(crate) struct Table {
    pub entries: HashMap<PodKey, Entry>,
    pub as_of: DateTime<Utc>,
}

impl Table {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            as_of: Utc::now(),
        }
    }
}

// -----------------------------------------------------------------------------
// Prober structure

struct Prober {
    fingerprint: u64,
    mode: ProbeMode,
    annotation_key: String,
    table: Arc<Mutex<Table>>,
    poller: Option<JoinHandle<()>>,
}

impl Drop for Prober {
    fn drop(&mut self) {
        if let Some(poller) = &self.poller {
            poller.abort();
        }
    }
}

// -----------------------------------------------------------------------------
// Engine structure

/// owns one busy state table per hot-standby resource and the http pollers
/// feeding them
pub struct Engine {
    pods: Store<Pod>,
    client: hyper::Client<HttpConnector>,
    concurrency: usize,
    probers: Mutex<HashMap<String, Prober>>,
}

impl Engine {
    pub fn new(pods: Store<Pod>, concurrency: usize) -> Self {
        Self {
            pods,
            client: hyper::Client::builder()
                .pool_idle_timeout(Duration::from_secs(30))
                .build_http(),
            concurrency,
            probers: Mutex::new(HashMap::new()),
        }
    }

    /// create or rebuild the prober of the given resource when its probe
    /// relevant configuration changed, a no-op otherwise
    pub async fn ensure(&self, obj: &HotStandbyDeployment) {
        let (namespace, name) = (
            obj.namespace().unwrap_or_default(),
            obj.name_any(),
        );
        let key = key(&namespace, &name);
        let fingerprint = fingerprint(obj);
        let mut probers = self.probers.lock().await;

        if probers.get(&key).map(|prober| prober.fingerprint) == Some(fingerprint) {
            return;
        }

        debug!(
            namespace = namespace.as_str(),
            name = name.as_str(),
            "Rebuild busy prober for custom resource",
        );

        let table = Arc::new(Mutex::new(Table::new()));
        let poller = match obj.spec.busy_probe.mode {
            ProbeMode::Annotation => None,
            ProbeMode::Http => Some(http::spawn(
                self.pods.to_owned(),
                self.client.to_owned(),
                key.to_owned(),
                namespace,
                obj.spec.selector.match_labels.to_owned(),
                obj.spec.busy_probe.http.to_owned(),
                table.to_owned(),
                self.concurrency,
            )),
        };

        probers.insert(
            key,
            Prober {
                fingerprint,
                mode: obj.spec.busy_probe.mode.to_owned(),
                annotation_key: obj.spec.busy_probe.annotation_key.to_owned(),
                table,
                poller,
            },
        );
    }

    /// returns a consistent copy of the busy state table of the given
    /// resource, pruned to the selected pod population. This method never
    /// fails, at worst the snapshot is stale or empty.
    pub async fn snapshot(
        &self,
        obj: &HotStandbyDeployment,
        selected: &[Arc<Pod>],
    ) -> Snapshot {
        self.ensure(obj).await;

        let key = key(&obj.namespace().unwrap_or_default(), &obj.name_any());
        let probers = self.probers.lock().await;
        let Some(prober) = probers.get(&key) else {
            return Snapshot {
                entries: HashMap::new(),
                as_of: Utc::now(),
            };
        };

        let mut table = prober.table.lock().await;

        match prober.mode {
            ProbeMode::Annotation => {
                annotation::refresh(&mut table, selected, &prober.annotation_key);
            }
            ProbeMode::Http => {
                let keep = selected
                    .iter()
                    .filter_map(|pod| PodKey::try_from_pod(pod))
                    .collect::<HashSet<_>>();

                table.entries.retain(|key, _| keep.contains(key));
            }
        }

        Snapshot {
            entries: table.entries.to_owned(),
            as_of: table.as_of,
        }
    }

    /// drop the busy state table of the given key and abort its poller
    pub async fn forget(&self, key: &str) {
        if self.probers.lock().await.remove(key).is_some() {
            debug!(key = key, "Drop busy state table of custom resource");
        }
    }
}

/// returns the fnv-1a hash of the probe relevant part of the resource spec
fn fingerprint(obj: &HotStandbyDeployment) -> u64 {
    let mut hasher = FnvHasher::default();

    match serde_json::to_vec(&(
        obj.namespace(),
        &obj.spec.selector,
        &obj.spec.busy_probe,
    )) {
        Ok(buf) => hasher.write(&buf),
        Err(_) => hasher.write(obj.name_any().as_bytes()),
    }

    hasher.finish()
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use kube::api::ObjectMeta;

    use super::*;

    pub(crate) fn pod(
        name: &str,
        labels: &[(&str, &str)],
        annotations: &[(&str, &str)],
        phase: Option<&str>,
    ) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some(name.to_string()),
                uid: Some(format!("uid-{}", name)),
                labels: Some(
                    labels
                        .iter()
                        .map(|(key, value)| (key.to_string(), value.to_string()))
                        .collect(),
                ),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(key, value)| (key.to_string(), value.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            status: phase.map(|phase| k8s_openapi::api::core::v1::PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn selector(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn selector_matches_should_require_a_subset() {
        let labels = selector(&[("app", "game-ws"), ("tier", "backend")]);

        assert!(selector_matches(&selector(&[("app", "game-ws")]), &labels));
        assert!(!selector_matches(&selector(&[("app", "other")]), &labels));
        assert!(!selector_matches(
            &selector(&[("app", "game-ws"), ("zone", "eu")]),
            &labels
        ));
        assert!(!selector_matches(&selector(&[]), &labels));
    }

    #[test]
    fn terminal_should_match_succeeded_and_failed_phases() {
        assert!(terminal(&pod("a", &[], &[], Some("Succeeded"))));
        assert!(terminal(&pod("b", &[], &[], Some("Failed"))));
        assert!(!terminal(&pod("c", &[], &[], Some("Running"))));
        assert!(!terminal(&pod("d", &[], &[], None)));
    }

    #[test]
    fn busy_count_should_treat_unknown_pods_as_idle() {
        let busy = pod("busy", &[], &[], Some("Running"));
        let unknown = pod("unknown", &[], &[], Some("Running"));
        let mut entries = HashMap::new();

        entries.insert(
            PodKey::try_from_pod(&busy).expect("pod to have an identity"),
            Entry {
                busy: true,
                last_observed: Utc::now(),
                last_probe_error: None,
            },
        );

        let snapshot = Snapshot {
            entries,
            as_of: Utc::now(),
        };

        assert_eq!(
            1,
            snapshot.busy_count(&[Arc::new(busy), Arc::new(unknown)])
        );
    }

    #[test]
    fn stale_should_compare_against_the_given_age() {
        let snapshot = Snapshot {
            entries: HashMap::new(),
            as_of: Utc::now() - chrono::Duration::seconds(60),
        };

        assert!(snapshot.stale(Duration::from_secs(20)));
        assert!(!snapshot.stale(Duration::from_secs(120)));
    }
}
