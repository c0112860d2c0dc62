//! Liveness reporting for the long-running loops of a shuttle process.
//!
//! Each loop (a shard consumer, the reconcile worker, the queue janitor) registers a component
//! and must report healthy more often than its deadline. The process is live only while every
//! registered component is: a loop that stops reporting is marked `Stalled`.
use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (code, format!("{:?}", self)).into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, has not reported yet.
    Starting,
    HealthyUntil(OffsetDateTime),
    Unhealthy,
    /// Missed its reporting deadline.
    Stalled,
}

impl ComponentStatus {
    /// Status as seen at `now`: an expired `HealthyUntil` reads as `Stalled`.
    fn at(&self, now: OffsetDateTime) -> ComponentStatus {
        match self {
            ComponentStatus::HealthyUntil(until) if *until <= now => ComponentStatus::Stalled,
            status => status.clone(),
        }
    }

    fn is_healthy(&self) -> bool {
        matches!(self, ComponentStatus::HealthyUntil(_))
    }
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Report healthy until now plus the registration deadline.
    pub async fn report_healthy(&self) {
        let until = OffsetDateTime::now_utc().add(self.deadline);
        self.report_status(ComponentStatus::HealthyUntil(until)).await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(error) = self.sender.send(message).await {
            warn!(component = self.component, "failed to report health status: {}", error)
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    /// Create a registry and spawn the task applying status reports to it.
    pub fn new(name: &str) -> Self {
        let (sender, mut receiver) = mpsc::channel::<HealthMessage>(16);
        let components: Arc<RwLock<HashMap<String, ComponentStatus>>> = Default::default();

        let applied = components.clone();
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match applied.write() {
                    Ok(mut map) => {
                        map.insert(message.component, message.status);
                    }
                    Err(_) => warn!("poisoned HealthRegistry lock"),
                }
            }
        });

        Self {
            name: name.to_owned(),
            components,
            sender,
        }
    }

    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Overall status. Unhealthy until at least one component has registered.
    /// Usable directly as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let now = OffsetDateTime::now_utc();
        let components: HashMap<String, ComponentStatus> = self
            .components
            .read()
            .expect("poisoned HealthRegistry lock")
            .iter()
            .map(|(name, status)| (name.clone(), status.at(now)))
            .collect();

        let healthy = !components.is_empty() && components.values().all(ComponentStatus::is_healthy);
        if healthy {
            debug!("{} health check ok", self.name);
        } else {
            warn!("{} health check failed: {:?}", self.name, components);
        }

        HealthStatus {
            healthy,
            components,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ops::Sub;

    use super::*;

    async fn eventually<F: Fn() -> bool>(check: F) {
        let deadline = OffsetDateTime::now_utc().add(Duration::seconds(5));
        while !check() && OffsetDateTime::now_utc() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn test_empty_registry_is_unhealthy() {
        assert!(!HealthRegistry::new("liveness").get_status().healthy);
    }

    #[tokio::test]
    async fn test_every_component_must_report() {
        let registry = HealthRegistry::new("liveness");
        let shard = registry
            .register("shard-all".to_owned(), Duration::seconds(30))
            .await;
        let janitor = registry
            .register("janitor".to_owned(), Duration::seconds(30))
            .await;
        eventually(|| registry.get_status().components.len() == 2).await;

        shard.report_healthy().await;
        eventually(|| {
            registry.get_status().components.get("shard-all") != Some(&ComponentStatus::Starting)
        })
        .await;
        assert!(!registry.get_status().healthy);

        janitor.report_healthy().await;
        eventually(|| registry.get_status().healthy).await;

        shard.report_status(ComponentStatus::Unhealthy).await;
        eventually(|| !registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn test_missed_deadline_reads_as_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("worker".to_owned(), Duration::seconds(30))
            .await;

        handle
            .report_status(ComponentStatus::HealthyUntil(
                OffsetDateTime::now_utc().sub(Duration::seconds(1)),
            ))
            .await;
        eventually(|| {
            registry.get_status().components.get("worker") == Some(&ComponentStatus::Stalled)
        })
        .await;
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn test_status_codes() {
        assert_eq!(
            HealthStatus::default().into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let healthy = HealthStatus {
            healthy: true,
            components: HashMap::new(),
        };
        assert_eq!(healthy.into_response().status(), StatusCode::OK);
    }
}
