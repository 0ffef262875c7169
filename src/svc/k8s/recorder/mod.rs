//! # Event recorder module
//!
//! This module provide an alternative to the golang EventRecorder structure
//! with a per resource and per action rate limit, so a flapping reconciliation
//! does not flood the event api.
//!
//! See following links for more details:
//! - <https://book-v1.book.kubebuilder.io/beyond_basics/creating_events.html>
//! - <https://github.com/kubernetes/client-go/blob/master/tools/record/event.go#L56>

use std::{
    collections::HashMap,
    fmt::{self, Debug, Display, Formatter},
    sync::Arc,
    time::{Duration, Instant},
};

use kube::{Client, CustomResourceExt, ResourceExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::svc::k8s::{resource, WriteLimiter};

pub mod event;

// -----------------------------------------------------------------------------
// constants

/// minimum delay between two events of the same action on the same resource
pub const RATE_LIMIT: Duration = Duration::from_secs(60);

// -----------------------------------------------------------------------------
// Level enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Debug)]
pub enum Level {
    Warning,
    Normal,
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "Warning"),
            Self::Normal => write!(f, "Normal"),
        }
    }
}

// -----------------------------------------------------------------------------
// Recorder structure

#[derive(Clone)]
pub struct Recorder {
    client: Client,
    limiter: Arc<WriteLimiter>,
    seen: Arc<Mutex<HashMap<(String, String), Instant>>>,
}

impl Recorder {
    pub fn new(client: Client, limiter: Arc<WriteLimiter>) -> Self {
        Self {
            client,
            limiter,
            seen: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// record an event with the 'Normal' [`Level`] for the given object
    pub async fn normal<T, U>(&self, obj: &T, action: &U, message: &str) -> Result<(), kube::Error>
    where
        T: ResourceExt + CustomResourceExt + Debug,
        U: ToString + Debug,
    {
        self.record(obj, &Level::Normal, action, message).await
    }

    /// record an event with the 'Warning' [`Level`] for the given object
    pub async fn warning<T, U>(&self, obj: &T, action: &U, message: &str) -> Result<(), kube::Error>
    where
        T: ResourceExt + CustomResourceExt + Debug,
        U: ToString + Debug,
    {
        self.record(obj, &Level::Warning, action, message).await
    }

    /// record an event for the given object, unless the same action was
    /// already recorded on this resource within [`RATE_LIMIT`]
    pub async fn record<T, U>(
        &self,
        obj: &T,
        kind: &Level,
        action: &U,
        message: &str,
    ) -> Result<(), kube::Error>
    where
        T: ResourceExt + CustomResourceExt + Debug,
        U: ToString + Debug,
    {
        let key = (
            format!(
                "{}/{}",
                obj.namespace().unwrap_or_else(|| "<none>".to_string()),
                obj.name_any()
            ),
            action.to_string(),
        );

        if !allow(&mut *self.seen.lock().await, key, Instant::now(), RATE_LIMIT) {
            debug!(
                action = action.to_string(),
                name = obj.name_any(),
                "skip event creation for resource, rate limited",
            );
            return Ok(());
        }

        debug!(
            action = action.to_string(),
            name = obj.name_any(),
            message = message,
            "Create event for resource",
        );

        self.limiter.until_ready().await;
        resource::upsert(
            self.client.to_owned(),
            &event::new(obj, kind, action, message),
        )
        .await?;

        Ok(())
    }
}

/// returns whether the given key may emit an event at `now` and update the
/// table accordingly
fn allow(
    seen: &mut HashMap<(String, String), Instant>,
    key: (String, String),
    now: Instant,
    limit: Duration,
) -> bool {
    match seen.get(&key) {
        Some(last) if now.duration_since(*last) < limit => false,
        _ => {
            seen.insert(key, now);
            true
        }
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str, action: &str) -> (String, String) {
        (name.to_string(), action.to_string())
    }

    #[test]
    fn allow_should_rate_limit_repeated_actions() {
        let mut seen = HashMap::new();
        let begin = Instant::now();

        assert!(allow(&mut seen, key("default/game", "Reconciled"), begin, RATE_LIMIT));
        assert!(!allow(
            &mut seen,
            key("default/game", "Reconciled"),
            begin + Duration::from_secs(10),
            RATE_LIMIT
        ));
        assert!(allow(
            &mut seen,
            key("default/game", "Reconciled"),
            begin + Duration::from_secs(61),
            RATE_LIMIT
        ));
    }

    #[test]
    fn allow_should_track_actions_independently() {
        let mut seen = HashMap::new();
        let begin = Instant::now();

        assert!(allow(&mut seen, key("default/game", "Reconciled"), begin, RATE_LIMIT));
        assert!(allow(&mut seen, key("default/game", "ChildScaled"), begin, RATE_LIMIT));
        assert!(allow(&mut seen, key("default/other", "Reconciled"), begin, RATE_LIMIT));
    }
}
