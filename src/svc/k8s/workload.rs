//! # Workload module
//!
//! This module provide helpers to build and inspect the child workload
//! realizing the pod template of a hot-standby custom resource

use std::{collections::BTreeMap, hash::Hasher};

use fnv::FnvHasher;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::PodTemplateSpec,
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{api::ObjectMeta, ResourceExt};

use crate::svc::{crd::hotstandby::HotStandbyDeployment, k8s::resource};

// -----------------------------------------------------------------------------
// constants

pub const NAME_SUFFIX: &str = "-workload";
pub const TEMPLATE_HASH_ANNOTATION: &str = "paia.tech/template-hash";

// -----------------------------------------------------------------------------
// Helpers functions

/// returns the name of the child workload owned by the given resource
pub fn name(obj: &HotStandbyDeployment) -> String {
    format!("{}{}", obj.name_any(), NAME_SUFFIX)
}

/// returns the pod template of the custom resource with its labels merged, so
/// pods created from it always match the resource selector
pub fn pod_template(obj: &HotStandbyDeployment) -> PodTemplateSpec {
    let mut template = obj.spec.pod_template.to_owned();
    let metadata = template.metadata.get_or_insert_with(Default::default);
    let labels = metadata.labels.get_or_insert_with(Default::default);

    for (key, value) in &obj.spec.selector.match_labels {
        labels.insert(key.to_owned(), value.to_owned());
    }

    template
}

/// returns the fnv-1a 64-bit hash of the canonical json representation of the
/// given pod template, as an hexadecimal string
pub fn template_hash(template: &PodTemplateSpec) -> Result<String, serde_json::Error> {
    let buf = serde_json::to_vec(template)?;
    let mut hasher = FnvHasher::default();

    hasher.write(&buf);
    Ok(format!("{:016x}", hasher.finish()))
}

/// returns the template hash recorded on the child workload, if any
pub fn recorded_hash(child: &Deployment) -> Option<String> {
    child.annotations().get(TEMPLATE_HASH_ANNOTATION).cloned()
}

/// returns whether the child workload is controlled by the given resource
pub fn owned_by(child: &Deployment, obj: &HotStandbyDeployment) -> bool {
    let uid = match obj.uid() {
        Some(uid) => uid,
        None => return false,
    };

    child
        .owner_references()
        .iter()
        .any(|reference| reference.controller == Some(true) && reference.uid == uid)
}

/// returns a new child workload for the given resource with the given number
/// of replicas
pub fn new(obj: &HotStandbyDeployment, replicas: i32) -> Result<Deployment, serde_json::Error> {
    let template = pod_template(obj);
    let hash = template_hash(&template)?;
    let mut annotations = BTreeMap::new();

    annotations.insert(TEMPLATE_HASH_ANNOTATION.to_string(), hash);

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(name(obj)),
            namespace: obj.namespace(),
            labels: Some(obj.spec.selector.match_labels.to_owned()),
            annotations: Some(annotations),
            owner_references: Some(vec![resource::owner_reference(obj)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(obj.spec.selector.match_labels.to_owned()),
                ..Default::default()
            },
            template,
            ..Default::default()
        }),
        ..Default::default()
    })
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    use super::*;
    use crate::svc::crd::hotstandby::{Selector, Spec};

    fn fixture() -> HotStandbyDeployment {
        let mut labels = BTreeMap::new();

        labels.insert("app".to_string(), "game-ws".to_string());

        let spec = Spec {
            idle_target: 3,
            min_replicas: 0,
            max_replicas: 50,
            selector: Selector {
                match_labels: labels,
            },
            pod_template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "game".to_string(),
                        image: Some("registry.example.com/game:v1".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            busy_probe: Default::default(),
        };

        let mut obj = HotStandbyDeployment::new("game-ws", spec);

        obj.metadata.namespace = Some("default".to_string());
        obj.metadata.uid = Some("a77878c8-90a9-4331-8acf-dc64e8bcca17".to_string());
        obj
    }

    #[test]
    fn name_should_append_the_workload_suffix() {
        assert_eq!("game-ws-workload", name(&fixture()));
    }

    #[test]
    fn pod_template_should_merge_selector_labels() {
        let template = pod_template(&fixture());
        let labels = template
            .metadata
            .expect("template to have a metadata")
            .labels
            .expect("template to have labels");

        assert_eq!(Some(&"game-ws".to_string()), labels.get("app"));
    }

    #[test]
    fn template_hash_should_be_stable() {
        let obj = fixture();
        let first = template_hash(&pod_template(&obj)).expect("template to serialize");
        let second = template_hash(&pod_template(&obj)).expect("template to serialize");

        assert_eq!(first, second);
        assert_eq!(16, first.len());
    }

    #[test]
    fn template_hash_should_change_with_the_image() {
        let obj = fixture();
        let mut modified = obj.to_owned();

        modified
            .spec
            .pod_template
            .spec
            .as_mut()
            .expect("template to have a pod spec")
            .containers[0]
            .image = Some("registry.example.com/game:v2".to_string());

        assert_ne!(
            template_hash(&pod_template(&obj)).expect("template to serialize"),
            template_hash(&pod_template(&modified)).expect("template to serialize"),
        );
    }

    #[test]
    fn new_should_record_the_template_hash_and_ownership() {
        let obj = fixture();
        let child = new(&obj, 3).expect("child workload to build");

        assert_eq!(Some(3), child.spec.as_ref().and_then(|spec| spec.replicas));
        assert_eq!(
            template_hash(&pod_template(&obj)).ok(),
            recorded_hash(&child)
        );

        let reference = &child.owner_references()[0];

        assert_eq!(Some(true), reference.controller);
        assert_eq!(Some(true), reference.block_owner_deletion);
        assert_eq!("HotStandbyDeployment", reference.kind);
        assert!(owned_by(&child, &obj));
    }

    #[test]
    fn owned_by_should_reject_foreign_children() {
        let obj = fixture();
        let mut child = new(&obj, 1).expect("child workload to build");

        child.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: "someone-else".to_string(),
            uid: "00000000-0000-0000-0000-000000000000".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]);
        assert!(!owned_by(&child, &obj));

        child.metadata.owner_references = None;
        assert!(!owned_by(&child, &obj));
    }
}
