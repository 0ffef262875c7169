//! # Annotation probe module
//!
//! Snapshot strategy of the busy probe: the busy state of a pod is carried by
//! an annotation set from inside the pod, the table is derived from the pod
//! informer cache and probing is therefore event-driven and free.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::svc::probe::{Entry, PodKey, Table, BUSY_VALUE};

/// returns whether the pod advertises itself as busy, the comparison is
/// case-sensitive and a missing annotation means idle
pub fn busy(pod: &Pod, annotation_key: &str) -> bool {
    pod.annotations()
        .get(annotation_key)
        .map(|value| value == BUSY_VALUE)
        .unwrap_or(false)
}

/// rebuild the table from the selected pod population, entries of pods that
/// left the population are dropped
pub(crate) fn refresh(table: &mut Table, selected: &[Arc<Pod>], annotation_key: &str) {
    let now = Utc::now();
    let mut entries = HashMap::with_capacity(selected.len());

    for pod in selected {
        if let Some(key) = PodKey::try_from_pod(pod) {
            entries.insert(
                key,
                Entry {
                    busy: busy(pod, annotation_key),
                    last_observed: now,
                    last_probe_error: None,
                },
            );
        }
    }

    table.entries = entries;
    table.as_of = now;
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::probe::{tests::pod, DEFAULT_ANNOTATION_KEY};

    #[test]
    fn busy_should_require_the_exact_true_value() {
        assert!(busy(
            &pod("a", &[], &[(DEFAULT_ANNOTATION_KEY, "true")], None),
            DEFAULT_ANNOTATION_KEY
        ));
        assert!(!busy(
            &pod("b", &[], &[(DEFAULT_ANNOTATION_KEY, "True")], None),
            DEFAULT_ANNOTATION_KEY
        ));
        assert!(!busy(
            &pod("c", &[], &[(DEFAULT_ANNOTATION_KEY, "false")], None),
            DEFAULT_ANNOTATION_KEY
        ));
        assert!(!busy(&pod("d", &[], &[], None), DEFAULT_ANNOTATION_KEY));
    }

    #[test]
    fn refresh_should_rebuild_the_table_and_prune_gone_pods() {
        let mut table = Table::new();
        let gone = pod("gone", &[], &[(DEFAULT_ANNOTATION_KEY, "true")], None);

        refresh(
            &mut table,
            &[Arc::new(gone)],
            DEFAULT_ANNOTATION_KEY,
        );
        assert_eq!(1, table.entries.len());

        let first = pod("first", &[], &[(DEFAULT_ANNOTATION_KEY, "true")], None);
        let second = pod("second", &[], &[], None);

        refresh(
            &mut table,
            &[Arc::new(first.to_owned()), Arc::new(second.to_owned())],
            DEFAULT_ANNOTATION_KEY,
        );

        assert_eq!(2, table.entries.len());

        let first_key = PodKey::try_from_pod(&first).expect("pod to have an identity");
        let second_key = PodKey::try_from_pod(&second).expect("pod to have an identity");

        assert!(table.entries[&first_key].busy);
        assert!(!table.entries[&second_key].busy);
    }
}
