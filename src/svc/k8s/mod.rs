//! # Kubernetes module
//!
//! This module provide the controller context, reconciliation traits and
//! helpers shared by every kubernetes facing part of the operator

use std::{
    collections::{BTreeMap, HashMap},
    error::Error,
    fmt::Debug,
    hash::Hash,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use governor::{
    clock::DefaultClock,
    state::{direct::NotKeyed, InMemoryState},
    RateLimiter,
};
use k8s_openapi::{api::core::v1::Pod, NamespaceResourceScope};
use kube::{
    runtime::{
        controller::{self, Action},
        reflector::Store,
        watcher, Controller,
    },
    CustomResourceExt, Resource, ResourceExt,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use serde::de::DeserializeOwned;
use tokio::{
    sync::Notify,
    time::{sleep_until, timeout, Instant},
};
use tracing::{debug, error, info, trace, warn};

use crate::svc::{cfg::Configuration, probe};

pub mod client;
pub mod lease;
pub mod recorder;
pub mod resource;
pub mod workload;

// -----------------------------------------------------------------------------
// constants

pub const RECONCILIATION_UPSERT_EVENT: &str = "upsert";
pub const RECONCILIATION_DELETE_EVENT: &str = "delete";

/// deadline of a single reconciliation pass
pub const RECONCILE_DEADLINE: Duration = Duration::from_secs(30);

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static RECONCILIATION_SUCCESS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_success",
            "number of successful reconciliation"
        ),
        &["kind"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_success' to not be already initialized")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_FAILED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_failed",
            "number of failed reconciliation"
        ),
        &["kind"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_failed' to not be already initialized")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_EVENT: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_event",
            "number of upsert event",
        ),
        &["kind", "namespace", "event"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_event' to not be already initialized")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_DURATION: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_duration",
            "duration of reconciliation",
        ),
        &["kind", "unit"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_duration' to not be already initialized")
});

// -----------------------------------------------------------------------------
// WriteLimiter type

/// token bucket applied to every write request issued to the kubernetes api
pub type WriteLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

// -----------------------------------------------------------------------------
// Selectors structure

/// index mapping each known custom resource to its pod selector, used to
/// route pod events back to the resources they belong to
#[derive(Clone, Default)]
pub struct Selectors {
    inner: Arc<RwLock<HashMap<String, (String, BTreeMap<String, String>)>>>,
}

impl Selectors {
    pub fn insert(&self, key: String, namespace: String, labels: BTreeMap<String, String>) {
        if let Ok(mut inner) = self.inner.write() {
            inner.insert(key, (namespace, labels));
        }
    }

    pub fn remove(&self, key: &str) {
        if let Ok(mut inner) = self.inner.write() {
            inner.remove(key);
        }
    }

    /// returns the namespace and name of every resource whose selector
    /// matches the given pod labels, selector overlap is user error and
    /// reconciles every match
    pub fn matching(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Vec<(String, String)> {
        let matches = match self.inner.read() {
            Ok(inner) => inner
                .iter()
                .filter(|(_, (ns, selector))| {
                    ns == namespace && probe::selector_matches(selector, labels)
                })
                .map(|(key, _)| {
                    let (ns, name) = key.split_once('/').unwrap_or(("", key));
                    (ns.to_string(), name.to_string())
                })
                .collect::<Vec<_>>(),
            Err(_) => vec![],
        };

        if matches.len() > 1 {
            warn!(
                namespace = namespace,
                count = matches.len(),
                "Pod labels match the selector of more than one custom resource",
            );
        }

        matches
    }
}

// -----------------------------------------------------------------------------
// Backoffs structure

/// per resource failure counter backing the exponential retry policy of the
/// reconciliation queue
#[derive(Clone, Default)]
pub struct Backoffs {
    inner: Arc<Mutex<HashMap<String, u32>>>,
}

impl Backoffs {
    pub const BASE: Duration = Duration::from_millis(500);
    pub const CAP: Duration = Duration::from_secs(300);

    /// returns the delay to wait before the next retry of the given key and
    /// bump its failure counter
    pub fn next(&self, key: &str) -> Duration {
        let failures = match self.inner.lock() {
            Ok(mut inner) => {
                let counter = inner.entry(key.to_string()).or_insert(0);

                *counter = counter.saturating_add(1);
                *counter - 1
            }
            Err(_) => 0,
        };

        Self::CAP.min(Self::BASE * 2u32.saturating_pow(failures.min(16)))
    }

    pub fn reset(&self, key: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.remove(key);
        }
    }
}

// -----------------------------------------------------------------------------
// Context structure

/// contains every shared collaborator of the reconciliation loop, built once
/// at startup and torn down on shutdown
#[derive(Clone)]
pub struct Context {
    pub kube: kube::Client,
    pub pods: Store<Pod>,
    pub probes: Arc<probe::Engine>,
    pub recorder: recorder::Recorder,
    pub selectors: Selectors,
    pub limiter: Arc<WriteLimiter>,
    pub backoffs: Backoffs,
    pub shutdown: Arc<Notify>,
    pub config: Arc<Configuration>,
}

impl Context {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kube: kube::Client,
        pods: Store<Pod>,
        probes: Arc<probe::Engine>,
        recorder: recorder::Recorder,
        limiter: Arc<WriteLimiter>,
        shutdown: Arc<Notify>,
        config: Arc<Configuration>,
    ) -> Self {
        Self {
            kube,
            pods,
            probes,
            recorder,
            selectors: Selectors::default(),
            limiter,
            backoffs: Backoffs::default(),
            shutdown,
            config,
        }
    }
}

// -----------------------------------------------------------------------------
// ControllerBuilder trait

/// provides a common way to create a kubernetes
/// controller [`Controller<T>`]
pub trait ControllerBuilder<T>
where
    T: Resource<Scope = NamespaceResourceScope> + Clone + Debug,
    <T as Resource>::DynamicType: Eq + Hash,
{
    /// returns a new created kubernetes controller
    fn build(&self, context: Arc<Context>) -> Controller<T>;
}

// -----------------------------------------------------------------------------
// Reconciler trait

/// provides the methods given to a kubernetes controller [`Controller<T>`]
#[async_trait]
pub trait Reconciler<T>
where
    T: Resource<Scope = NamespaceResourceScope>
        + ResourceExt
        + CustomResourceExt
        + Debug
        + Clone
        + Send
        + Sync
        + 'static,
{
    type Error: Error + Send + Sync + From<tokio::time::error::Elapsed>;

    /// create or update the child resources of the object, returns the next
    /// requeue action, this is part of the reconcile function
    async fn upsert(ctx: Arc<Context>, obj: Arc<T>) -> Result<Action, Self::Error>;

    /// release the in-memory state attached to the object
    async fn delete(ctx: Arc<Context>, obj: Arc<T>) -> Result<(), Self::Error>;

    /// returns a [`Action`] to perform following the given error, retries are
    /// spread with a per key exponential backoff
    fn retry(obj: Arc<T>, err: &Self::Error, ctx: Arc<Context>) -> Action {
        let (namespace, name) = resource::namespaced_name(&*obj);
        let delay = ctx.backoffs.next(&probe::key(&namespace, &name));

        trace!(
            namespace = namespace.as_str(),
            name = name.as_str(),
            delay = delay.as_millis() as u64,
            error = err.to_string(),
            "Requeue failed reconciliation",
        );
        Action::requeue(delay)
    }

    /// process the object and perform actions on the kubernetes api, returns
    /// a [`Action`] to perform another reconciliation or an error, if
    /// something gets wrong
    async fn reconcile(obj: Arc<T>, ctx: Arc<Context>) -> Result<Action, Self::Error> {
        let (namespace, name) = resource::namespaced_name(&*obj);
        let api_resource = T::api_resource();

        if resource::deleted(obj.as_ref()) {
            info!(
                kind = api_resource.kind.as_str(),
                namespace = namespace.as_str(),
                name = name.as_str(),
                "Received deletion event for custom resource",
            );

            #[cfg(feature = "metrics")]
            RECONCILIATION_EVENT
                .with_label_values(&[&api_resource.kind, &namespace, RECONCILIATION_DELETE_EVENT])
                .inc();

            if let Err(err) = Self::delete(ctx, obj.to_owned()).await {
                error!(
                    kind = api_resource.kind.as_str(),
                    namespace = namespace.as_str(),
                    name = name.as_str(),
                    error = err.to_string(),
                    "Failed to release custom resource"
                );

                return Err(err);
            }

            return Ok(Action::await_change());
        }

        info!(
            kind = api_resource.kind.as_str(),
            namespace = namespace.as_str(),
            name = name.as_str(),
            "Received upsertion event for custom resource",
        );

        #[cfg(feature = "metrics")]
        RECONCILIATION_EVENT
            .with_label_values(&[&api_resource.kind, &namespace, RECONCILIATION_UPSERT_EVENT])
            .inc();

        match timeout(RECONCILE_DEADLINE, Self::upsert(ctx.to_owned(), obj.to_owned())).await {
            Ok(Ok(action)) => {
                ctx.backoffs.reset(&probe::key(&namespace, &name));
                Ok(action)
            }
            Ok(Err(err)) => {
                error!(
                    kind = api_resource.kind.as_str(),
                    namespace = namespace.as_str(),
                    name = name.as_str(),
                    error = err.to_string(),
                    "Failed to upsert custom resource"
                );

                Err(err)
            }
            Err(elapsed) => {
                error!(
                    kind = api_resource.kind.as_str(),
                    namespace = namespace.as_str(),
                    name = name.as_str(),
                    "Reconciliation of custom resource exceeded its deadline"
                );

                Err(Self::Error::from(elapsed))
            }
        }
    }
}

// -----------------------------------------------------------------------------
// WatcherError trait

/// group other trait needed to provide a default
/// implementation for [`Watcher<T>`] trait
pub trait WatcherError:
    From<kube::Error> + From<controller::Error<Self, watcher::Error>> + Error
where
    Self: 'static,
{
}

/// Blanket implementation of [`WatcherError<T>`]
impl<T> WatcherError for T
where
    T: From<kube::Error> + From<controller::Error<Self, watcher::Error>> + Error,
    Self: 'static,
{
}

// -----------------------------------------------------------------------------
// Watcher trait

/// provides a watch method that listen to events of
/// kubernetes custom resource using a [`Controller<T>`]
#[async_trait]
pub trait Watcher<T>: ControllerBuilder<T> + Reconciler<T>
where
    T: Resource<Scope = NamespaceResourceScope>
        + ResourceExt
        + CustomResourceExt
        + DeserializeOwned
        + Clone
        + Debug
        + Send
        + Sync
        + 'static,
    <T as Resource>::DynamicType: Unpin + Eq + Hash + Clone + Debug + Default + Send + Sync,
    Self: Send + Sync + 'static,
    <Self as Reconciler<T>>::Error: WatcherError + Send + Sync,
{
    type Error: WatcherError + Send + Sync;

    /// listen for events of the custom resource as generic parameter
    async fn watch(&self, context: Arc<Context>) -> Result<(), <Self as Watcher<T>>::Error> {
        let api_resource = T::api_resource();
        let mut stream = self
            .build(context.to_owned())
            .run(Self::reconcile, Self::retry, context.to_owned())
            .boxed();

        loop {
            let instant = Instant::now();

            match stream.try_next().await {
                Ok(None) => {
                    debug!("We have reached the end of the infinite watch stream");
                    return Ok(());
                }
                Ok(Some((obj, _action))) => {
                    info!(
                        kind = api_resource.kind.as_str(),
                        namespace = obj.namespace.to_owned().unwrap_or_else(|| "<none>".to_string()),
                        name = obj.name.as_str(),
                        "Successfully reconcile resource",
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_SUCCESS
                        .with_label_values(&[&api_resource.kind])
                        .inc();
                }
                Err(controller::Error::ObjectNotFound(obj)) => {
                    debug!(
                        kind = api_resource.kind.as_str(),
                        namespace = obj.namespace.to_owned().unwrap_or_else(|| "<none>".to_string()),
                        name = obj.name.as_str(),
                        "Received an event about an already deleted resource",
                    );

                    // the resource vanished without a deletion pass, release
                    // its in-memory state here
                    let key =
                        probe::key(obj.namespace.as_deref().unwrap_or_default(), &obj.name);

                    context.probes.forget(&key).await;
                    context.selectors.remove(&key);
                    context.backoffs.reset(&key);

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_SUCCESS
                        .with_label_values(&[&api_resource.kind])
                        .inc();
                }
                Err(err) => {
                    error!(
                        kind = api_resource.kind.as_str(),
                        error = err.to_string(),
                        "Failed to reconcile resource",
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_FAILED
                        .with_label_values(&[&api_resource.kind])
                        .inc();
                }
            }

            trace!(
                kind = api_resource.kind.as_str(),
                duration = Instant::now()
                    .checked_duration_since(instant + Duration::from_millis(100))
                    .map(|d| d.as_millis())
                    .unwrap_or(0) as u64,
                "Put watch event loop for resource to sleep",
            );

            #[cfg(feature = "metrics")]
            RECONCILIATION_DURATION
                .with_label_values(&[&api_resource.kind, "us"])
                .inc_by(Instant::now().duration_since(instant).as_micros() as f64);

            sleep_until(instant + Duration::from_millis(100)).await;
        }
    }
}

/// Blanket implementation for [`Watcher<T>`]
impl<T, U> Watcher<T> for U
where
    T: Resource<Scope = NamespaceResourceScope>
        + ResourceExt
        + CustomResourceExt
        + DeserializeOwned
        + Clone
        + Debug
        + Send
        + Sync
        + 'static,
    <T as Resource>::DynamicType: Unpin + Eq + Hash + Clone + Debug + Default + Send + Sync,
    U: Reconciler<T> + ControllerBuilder<T>,
    U::Error: WatcherError + Send + Sync,
    Self: Send + Sync + 'static,
{
    type Error = U::Error;
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoffs_should_grow_exponentially_and_reset() {
        let backoffs = Backoffs::default();

        assert_eq!(Duration::from_millis(500), backoffs.next("default/game"));
        assert_eq!(Duration::from_millis(1000), backoffs.next("default/game"));
        assert_eq!(Duration::from_millis(2000), backoffs.next("default/game"));

        backoffs.reset("default/game");
        assert_eq!(Duration::from_millis(500), backoffs.next("default/game"));
    }

    #[test]
    fn backoffs_should_cap_the_delay() {
        let backoffs = Backoffs::default();

        for _ in 0..32 {
            backoffs.next("default/game");
        }

        assert_eq!(Backoffs::CAP, backoffs.next("default/game"));
    }

    #[test]
    fn selectors_should_route_pod_labels_to_matching_resources() {
        let selectors = Selectors::default();
        let labels = [("app".to_string(), "game-ws".to_string())]
            .into_iter()
            .collect::<BTreeMap<_, _>>();

        selectors.insert(
            "default/game".to_string(),
            "default".to_string(),
            labels.to_owned(),
        );

        assert_eq!(
            vec![("default".to_string(), "game".to_string())],
            selectors.matching("default", &labels)
        );
        assert!(selectors.matching("other", &labels).is_empty());

        selectors.remove("default/game");
        assert!(selectors.matching("default", &labels).is_empty());
    }
}
