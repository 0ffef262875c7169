//! # Hot-standby deployment
//!
//! This module provide the hot-standby custom resource and its reconciliation
//! loop. The controller converges a child workload to
//! `clamp(busyCount + idleTarget, minReplicas, maxReplicas)` replicas, where
//! the busy count is derived from the configured busy probe.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Pod, PodTemplateSpec},
};
use kube::{
    api::PostParams,
    runtime::{
        controller::{self, Action},
        reflector::ObjectRef,
        watcher, Controller,
    },
    Api, CustomResource, Resource, ResourceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::svc::{
    cfg::Configuration,
    k8s::{self, resource, workload, Context, ControllerBuilder},
    probe,
};

// -----------------------------------------------------------------------------
// Constants

/// requeue interval of resources the controller must not touch, either
/// invalid or conflicting ones
pub const LONG_REQUEUE: Duration = Duration::from_secs(300);

/// number of inline retries of a conflicting status write
pub const STATUS_WRITE_RETRIES: usize = 3;

// -----------------------------------------------------------------------------
// Selector structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Selector {
    #[serde(rename = "matchLabels", default)]
    pub match_labels: BTreeMap<String, String>,
}

// -----------------------------------------------------------------------------
// ProbeMode enumeration

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub enum ProbeMode {
    #[default]
    #[serde(rename = "annotation")]
    Annotation,
    #[serde(rename = "http")]
    Http,
}

// -----------------------------------------------------------------------------
// HttpProbe structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct HttpProbe {
    #[serde(rename = "port", default = "default_http_port")]
    pub port: u16,
    #[serde(rename = "path", default = "default_http_path")]
    pub path: String,
    /// when true a 2xx response means busy, when false it means idle
    #[serde(rename = "successIsBusy", default = "default_success_is_busy")]
    pub success_is_busy: bool,
    #[serde(rename = "timeoutSeconds", default = "default_http_timeout")]
    pub timeout_seconds: u32,
    #[serde(rename = "periodSeconds", default = "default_http_period")]
    pub period_seconds: u32,
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self {
            port: default_http_port(),
            path: default_http_path(),
            success_is_busy: default_success_is_busy(),
            timeout_seconds: default_http_timeout(),
            period_seconds: default_http_period(),
        }
    }
}

// -----------------------------------------------------------------------------
// BusyProbe structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct BusyProbe {
    #[serde(rename = "mode", default)]
    pub mode: ProbeMode,
    #[serde(rename = "annotationKey", default = "default_annotation_key")]
    pub annotation_key: String,
    #[serde(rename = "http", default)]
    pub http: HttpProbe,
}

impl Default for BusyProbe {
    fn default() -> Self {
        Self {
            mode: ProbeMode::default(),
            annotation_key: default_annotation_key(),
            http: HttpProbe::default(),
        }
    }
}

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "apps.paia.tech")]
#[kube(version = "v1alpha1")]
#[kube(kind = "HotStandbyDeployment")]
#[kube(singular = "hotstandbydeployment")]
#[kube(plural = "hotstandbydeployments")]
#[kube(shortname = "hsd")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
pub struct Spec {
    /// number of idle replicas to keep warm on top of the busy ones
    #[serde(rename = "idleTarget")]
    pub idle_target: i32,
    #[serde(rename = "minReplicas", default)]
    pub min_replicas: i32,
    #[serde(rename = "maxReplicas", default = "default_max_replicas")]
    pub max_replicas: i32,
    #[serde(rename = "selector")]
    pub selector: Selector,
    /// copied verbatim into the child workload, labels are merged with the
    /// selector
    #[serde(rename = "podTemplate")]
    pub pod_template: PodTemplateSpec,
    #[serde(rename = "busyProbe", default)]
    pub busy_probe: BusyProbe,
}

impl Spec {
    /// returns why the spec cannot be acted on, if anything
    pub fn validate(&self) -> Result<(), String> {
        if self.idle_target < 0 {
            return Err(format!(
                "idleTarget must be greater than or equal to 0, got {}",
                self.idle_target
            ));
        }

        if self.min_replicas < 0 {
            return Err(format!(
                "minReplicas must be greater than or equal to 0, got {}",
                self.min_replicas
            ));
        }

        if self.max_replicas < 1 {
            return Err(format!(
                "maxReplicas must be greater than or equal to 1, got {}",
                self.max_replicas
            ));
        }

        if self.min_replicas > self.max_replicas {
            return Err(format!(
                "minReplicas ({}) must not exceed maxReplicas ({})",
                self.min_replicas, self.max_replicas
            ));
        }

        if self.selector.match_labels.is_empty() {
            return Err("selector.matchLabels must not be empty".to_string());
        }

        Ok(())
    }

    /// returns the replica count converged to for the given busy count
    pub fn desired_replicas(&self, busy: i32) -> i32 {
        self.max_replicas
            .min(busy.saturating_add(self.idle_target))
            .max(self.min_replicas)
    }
}

fn default_max_replicas() -> i32 {
    i32::MAX
}

fn default_annotation_key() -> String {
    probe::DEFAULT_ANNOTATION_KEY.to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_http_path() -> String {
    "/busy".to_string()
}

fn default_success_is_busy() -> bool {
    true
}

fn default_http_timeout() -> u32 {
    1
}

fn default_http_period() -> u32 {
    10
}

// -----------------------------------------------------------------------------
// Status structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "observedGeneration")]
    pub observed_generation: Option<i64>,
    #[serde(rename = "busyCount")]
    pub busy_count: i32,
    #[serde(rename = "idleCount")]
    pub idle_count: i32,
    #[serde(rename = "desiredReplicas")]
    pub desired_replicas: i32,
}

// -----------------------------------------------------------------------------
// Reason enumeration

/// reasons of the events published on the custom resource
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Debug)]
pub enum Reason {
    Reconciled,
    ChildCreated,
    ChildScaled,
    TemplateUpdated,
    InvalidSpec,
    OwnershipConflict,
    ProbeErrors,
}

impl Display for Reason {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Reconciled => write!(f, "Reconciled"),
            Self::ChildCreated => write!(f, "ChildCreated"),
            Self::ChildScaled => write!(f, "ChildScaled"),
            Self::TemplateUpdated => write!(f, "TemplateUpdated"),
            Self::InvalidSpec => write!(f, "InvalidSpec"),
            Self::OwnershipConflict => write!(f, "OwnershipConflict"),
            Self::ProbeErrors => write!(f, "ProbeErrors"),
        }
    }
}

// -----------------------------------------------------------------------------
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to reconcile resource, {0}")]
    Reconcile(String),
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("failed to compute diff between the original and modified object, {0}")]
    Diff(serde_json::Error),
    #[error("failed to serialize pod template, {0}")]
    Serialize(serde_json::Error),
    #[error("reconciliation did not complete within its deadline, {0}")]
    Deadline(tokio::time::error::Elapsed),
}

impl From<kube::Error> for ReconcilerError {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

impl From<tokio::time::error::Elapsed> for ReconcilerError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::Deadline(err)
    }
}

impl From<controller::Error<Self, watcher::Error>> for ReconcilerError {
    fn from(err: controller::Error<ReconcilerError, watcher::Error>) -> Self {
        Self::Reconcile(err.to_string())
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl ControllerBuilder<HotStandbyDeployment> for Reconciler {
    fn build(&self, context: Arc<Context>) -> Controller<HotStandbyDeployment> {
        let client = context.kube.to_owned();
        let (resources, children, pods) = match &context.config.operator.namespace {
            Some(namespace) => (
                Api::namespaced(client.to_owned(), namespace),
                Api::<Deployment>::namespaced(client.to_owned(), namespace),
                Api::<Pod>::namespaced(client, namespace),
            ),
            None => (
                Api::all(client.to_owned()),
                Api::<Deployment>::all(client.to_owned()),
                Api::<Pod>::all(client),
            ),
        };

        let selectors = context.selectors.to_owned();
        let shutdown = context.shutdown.to_owned();

        Controller::new(resources, watcher::Config::default())
            .owns(children, watcher::Config::default())
            .watches(pods, watcher::Config::default(), move |pod: Pod| {
                let namespace = pod.namespace().unwrap_or_default();

                selectors
                    .matching(&namespace, pod.labels())
                    .into_iter()
                    .map(|(namespace, name)| {
                        ObjectRef::<HotStandbyDeployment>::new(&name).within(&namespace)
                    })
                    .collect::<Vec<_>>()
            })
            .with_config(
                controller::Config::default().concurrency(context.config.operator.workers),
            )
            .graceful_shutdown_on(async move { shutdown.notified().await })
    }
}

#[async_trait]
impl k8s::Reconciler<HotStandbyDeployment> for Reconciler {
    type Error = ReconcilerError;

    async fn upsert(
        ctx: Arc<Context>,
        origin: Arc<HotStandbyDeployment>,
    ) -> Result<Action, ReconcilerError> {
        let Context {
            kube,
            pods,
            probes,
            recorder,
            selectors,
            limiter,
            config,
            ..
        } = ctx.as_ref();
        let kind = HotStandbyDeployment::kind(&()).to_string();
        let (namespace, name) = resource::namespaced_name(&*origin);
        let key = probe::key(&namespace, &name);
        let generation = origin.metadata.generation;

        // ---------------------------------------------------------------------
        // Step 1: validate the spec, an invalid resource is reported and left
        // untouched

        if let Err(reason) = origin.spec.validate() {
            warn!(
                kind = kind.as_str(),
                namespace = namespace.as_str(),
                name = name.as_str(),
                generation = generation.unwrap_or(0),
                reason = reason.as_str(),
                "Skip reconciliation of custom resource with invalid spec",
            );
            recorder
                .warning(&*origin, &Reason::InvalidSpec, &reason)
                .await?;

            return Ok(Action::requeue(LONG_REQUEUE));
        }

        // ---------------------------------------------------------------------
        // Step 2: register the selector for pod event routing and refresh the
        // busy prober

        selectors.insert(
            key.to_owned(),
            namespace.to_owned(),
            origin.spec.selector.match_labels.to_owned(),
        );
        probes.ensure(&origin).await;

        // ---------------------------------------------------------------------
        // Step 3: enumerate selected pods from the informer cache and count
        // busy ones

        let selected = probe::select_pods(pods, &namespace, &origin.spec.selector.match_labels);
        let snapshot = probes.snapshot(&origin, &selected).await;
        let busy = snapshot.busy_count(&selected);
        let idle = selected.len() as i32 - busy;

        // ---------------------------------------------------------------------
        // Step 4: compute the desired replica count

        let desired = origin.spec.desired_replicas(busy);

        info!(
            kind = kind.as_str(),
            namespace = namespace.as_str(),
            name = name.as_str(),
            generation = generation.unwrap_or(0),
            busy = busy,
            idle = idle,
            desired = desired,
            "Computed desired replica count for custom resource",
        );

        // ---------------------------------------------------------------------
        // Step 5: converge the child workload

        let child_name = workload::name(&origin);
        let api: Api<Deployment> = Api::namespaced(kube.to_owned(), &namespace);
        let mut conflicted = false;

        match resource::find(&api, &child_name).await? {
            None => {
                debug!(
                    namespace = namespace.as_str(),
                    name = child_name.as_str(),
                    "Create child workload for custom resource",
                );

                let child = workload::new(&origin, desired).map_err(ReconcilerError::Serialize)?;

                limiter.until_ready().await;
                match api.create(&PostParams::default(), &child).await {
                    Ok(_) => {
                        recorder
                            .normal(
                                &*origin,
                                &Reason::ChildCreated,
                                &format!(
                                    "Create child workload '{}' with {} replicas",
                                    child_name, desired
                                ),
                            )
                            .await?;
                    }
                    // someone created it in between, the next pass inspects
                    // its ownership
                    Err(kube::Error::Api(err)) if err.code == 409 => {
                        return Ok(Action::requeue(Duration::from_secs(1)));
                    }
                    Err(err) => {
                        return Err(ReconcilerError::KubeClient(err));
                    }
                }
            }
            Some(child) if !workload::owned_by(&child, &origin) => {
                conflicted = true;
                warn!(
                    kind = kind.as_str(),
                    namespace = namespace.as_str(),
                    name = name.as_str(),
                    child = child_name.as_str(),
                    "Child workload exists but is not controlled by the custom resource",
                );
                recorder
                    .warning(
                        &*origin,
                        &Reason::OwnershipConflict,
                        &format!(
                            "Child workload '{}' exists but is not controlled by this resource",
                            child_name
                        ),
                    )
                    .await?;
            }
            Some(child) => {
                let mut modified = child.to_owned();
                let current = child.spec.as_ref().and_then(|spec| spec.replicas);

                if let Some(spec) = modified.spec.as_mut() {
                    spec.replicas = Some(desired);
                }

                let template = workload::pod_template(&origin);
                let hash = workload::template_hash(&template).map_err(ReconcilerError::Serialize)?;
                let template_changed =
                    workload::recorded_hash(&child).as_deref() != Some(hash.as_str());

                if template_changed {
                    if let Some(spec) = modified.spec.as_mut() {
                        spec.template = template;
                    }

                    modified
                        .metadata
                        .annotations
                        .get_or_insert_with(Default::default)
                        .insert(workload::TEMPLATE_HASH_ANNOTATION.to_string(), hash);
                }

                let patch = resource::diff(&child, &modified).map_err(ReconcilerError::Diff)?;

                if !patch.0.is_empty() {
                    limiter.until_ready().await;
                    resource::patch(kube.to_owned(), &modified, patch).await?;

                    if current != Some(desired) {
                        recorder
                            .normal(
                                &*origin,
                                &Reason::ChildScaled,
                                &format!(
                                    "Scale child workload '{}' from {} to {} replicas",
                                    child_name,
                                    current.unwrap_or(0),
                                    desired
                                ),
                            )
                            .await?;
                    }

                    if template_changed {
                        recorder
                            .normal(
                                &*origin,
                                &Reason::TemplateUpdated,
                                &format!("Update pod template of child workload '{}'", child_name),
                            )
                            .await?;
                    }
                }
            }
        }

        // ---------------------------------------------------------------------
        // Step 6: publish the status, skipped entirely when it did not change

        let status = Status {
            observed_generation: generation,
            busy_count: busy,
            idle_count: idle,
            desired_replicas: desired,
        };

        write_status(ctx.as_ref(), &origin, status).await?;

        // ---------------------------------------------------------------------
        // Step 7: surface probe failures

        let failures = snapshot.probe_errors();

        if failures > 0 {
            recorder
                .warning(
                    &*origin,
                    &Reason::ProbeErrors,
                    &format!(
                        "{} of {} selected pods failed their last busy probe",
                        failures,
                        selected.len()
                    ),
                )
                .await?;
        }

        // ---------------------------------------------------------------------
        // Step 8: close the loop

        if conflicted {
            return Ok(Action::requeue(LONG_REQUEUE));
        }

        recorder
            .normal(
                &*origin,
                &Reason::Reconciled,
                &format!(
                    "Reconciled to {} busy, {} idle and {} desired replicas",
                    busy, idle, desired
                ),
            )
            .await?;

        Ok(Action::requeue(requeue_after(&origin, &snapshot, config)))
    }

    async fn delete(
        ctx: Arc<Context>,
        origin: Arc<HotStandbyDeployment>,
    ) -> Result<(), ReconcilerError> {
        let (namespace, name) = resource::namespaced_name(&*origin);
        let key = probe::key(&namespace, &name);

        // the child workload is cascade deleted through its owner reference,
        // only the in-memory state remains to release
        ctx.probes.forget(&key).await;
        ctx.selectors.remove(&key);
        ctx.backoffs.reset(&key);

        info!(
            namespace = namespace.as_str(),
            name = name.as_str(),
            "Released in-memory state of custom resource",
        );

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Helpers functions

/// returns the closing requeue interval, shortened to the probe period when
/// the http snapshot went stale
fn requeue_after(
    obj: &HotStandbyDeployment,
    snapshot: &probe::Snapshot,
    config: &Arc<Configuration>,
) -> Duration {
    let base = Duration::from_secs(config.operator.requeue_interval.max(1));

    if obj.spec.busy_probe.mode == ProbeMode::Http {
        let period =
            Duration::from_secs(u64::from(obj.spec.busy_probe.http.period_seconds.max(1)));

        if snapshot.stale(period * 2) {
            return period.min(base);
        }
    }

    base
}

/// update the status subresource unless it already carries the computed
/// values, conflicts are retried with a fresh read
async fn write_status(
    ctx: &Context,
    origin: &Arc<HotStandbyDeployment>,
    status: Status,
) -> Result<(), ReconcilerError> {
    let (namespace, name) = resource::namespaced_name(&**origin);

    if origin.status.as_ref() == Some(&status) {
        debug!(
            namespace = namespace.as_str(),
            name = name.as_str(),
            "skip status update of custom resource, nothing changed",
        );
        return Ok(());
    }

    let api: Api<HotStandbyDeployment> = Api::namespaced(ctx.kube.to_owned(), &namespace);
    let mut current = (**origin).to_owned();

    for attempt in 1..=STATUS_WRITE_RETRIES {
        let mut modified = current.to_owned();

        modified.status = Some(status.to_owned());

        let patch = resource::diff(&current, &modified).map_err(ReconcilerError::Diff)?;

        if patch.0.is_empty() {
            return Ok(());
        }

        ctx.limiter.until_ready().await;
        match resource::patch_status(ctx.kube.to_owned(), modified, patch).await {
            Ok(_) => {
                return Ok(());
            }
            Err(kube::Error::Api(err)) if err.code == 409 && attempt < STATUS_WRITE_RETRIES => {
                debug!(
                    namespace = namespace.as_str(),
                    name = name.as_str(),
                    attempt = attempt as u64,
                    "Conflict on status update of custom resource, retry with a fresh read",
                );
                current = api.get(&name).await?;
            }
            Err(err) => {
                return Err(ReconcilerError::KubeClient(err));
            }
        }
    }

    Ok(())
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::svc::cfg::{Api as ApiBudget, Lease, Operator};

    fn spec(idle_target: i32, min_replicas: i32, max_replicas: i32) -> Spec {
        serde_json::from_value(json!({
            "idleTarget": idle_target,
            "minReplicas": min_replicas,
            "maxReplicas": max_replicas,
            "selector": {"matchLabels": {"app": "game-ws"}},
            "podTemplate": {},
        }))
        .expect("spec to deserialize")
    }

    #[test]
    fn spec_should_apply_documented_defaults() {
        let spec: Spec = serde_json::from_value(json!({
            "idleTarget": 3,
            "selector": {"matchLabels": {"app": "game-ws"}},
            "podTemplate": {},
        }))
        .expect("spec to deserialize");

        assert_eq!(0, spec.min_replicas);
        assert_eq!(i32::MAX, spec.max_replicas);
        assert_eq!(ProbeMode::Annotation, spec.busy_probe.mode);
        assert_eq!("paia.tech/busy", spec.busy_probe.annotation_key);
        assert_eq!(8080, spec.busy_probe.http.port);
        assert_eq!("/busy", spec.busy_probe.http.path);
        assert!(spec.busy_probe.http.success_is_busy);
        assert_eq!(1, spec.busy_probe.http.timeout_seconds);
        assert_eq!(10, spec.busy_probe.http.period_seconds);
    }

    #[test]
    fn validate_should_reject_inconsistent_bounds() {
        assert!(spec(3, 0, 50).validate().is_ok());
        assert!(spec(-1, 0, 50).validate().is_err());
        assert!(spec(3, 10, 4).validate().is_err());
        assert!(spec(3, 0, 0).validate().is_err());

        let mut empty_selector = spec(3, 0, 50);

        empty_selector.selector.match_labels.clear();
        assert!(empty_selector.validate().is_err());
    }

    #[test]
    fn desired_replicas_should_clamp_between_bounds() {
        // no busy pod converges to the idle target
        assert_eq!(3, spec(3, 0, 50).desired_replicas(0));
        // two busy pods on top of the idle target
        assert_eq!(5, spec(3, 0, 50).desired_replicas(2));
        // clamped to the upper bound
        assert_eq!(4, spec(10, 0, 4).desired_replicas(0));
        // raised to the lower bound
        assert_eq!(5, spec(0, 5, 50).desired_replicas(0));
        // zero idle target follows the busy count
        assert_eq!(7, spec(0, 0, 50).desired_replicas(7));
    }

    #[test]
    fn desired_replicas_should_saturate_instead_of_overflowing() {
        assert_eq!(i32::MAX, spec(i32::MAX, 0, i32::MAX).desired_replicas(12));
    }

    #[test]
    fn status_should_compare_for_idempotent_writes() {
        let status = Status {
            observed_generation: Some(2),
            busy_count: 2,
            idle_count: 3,
            desired_replicas: 5,
        };

        assert_eq!(status, status.to_owned());
        assert_ne!(
            status,
            Status {
                desired_replicas: 6,
                ..status.to_owned()
            }
        );
    }

    fn configuration(requeue_interval: u64) -> Arc<Configuration> {
        Arc::new(Configuration {
            operator: Operator {
                listen: "0.0.0.0:8000".to_string(),
                namespace: None,
                workers: 2,
                probe_concurrency: 16,
                requeue_interval,
                leader_elect: false,
            },
            api: ApiBudget {
                query_per_second: 20,
                burst: 40,
            },
            lease: Lease {
                namespace: "default".to_string(),
                duration: 30,
            },
        })
    }

    #[test]
    fn requeue_after_should_shorten_on_stale_http_snapshot() {
        let config = configuration(30);
        let mut obj = HotStandbyDeployment::new("game-ws", spec(3, 0, 50));

        obj.spec.busy_probe.mode = ProbeMode::Http;

        let fresh = probe::Snapshot {
            entries: Default::default(),
            as_of: Utc::now(),
        };
        let stale = probe::Snapshot {
            entries: Default::default(),
            as_of: Utc::now() - chrono::Duration::seconds(60),
        };

        assert_eq!(Duration::from_secs(30), requeue_after(&obj, &fresh, &config));
        assert_eq!(Duration::from_secs(10), requeue_after(&obj, &stale, &config));

        obj.spec.busy_probe.mode = ProbeMode::Annotation;
        assert_eq!(Duration::from_secs(30), requeue_after(&obj, &stale, &config));
    }
}
