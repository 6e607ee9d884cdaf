//! Liveness of the broker's long-running loops.
//!
//! The dispatcher, the kafka clients and every subscription's batch window
//! own a `HealthHandle` and report through it. The process is live only while
//! every registered component reported within its deadline. A subscription
//! that gave up reports `Terminated`, which no later heartbeat can overwrite:
//! `/_liveness` stays red until the process restarts and resumes from the last
//! committed offsets.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, has not reported yet
    Starting,
    /// Reported healthy, must report again before this date
    HealthyUntil(OffsetDateTime),
    Unhealthy,
    /// Stopped for good, with the reason it gave up
    Terminated(String),
    /// Missed its `HealthyUntil` deadline
    Stalled,
}

impl ComponentStatus {
    fn observed_at(&self, now: OffsetDateTime) -> ComponentStatus {
        match self {
            ComponentStatus::HealthyUntil(until) if *until <= now => ComponentStatus::Stalled,
            status => status.clone(),
        }
    }

    fn is_healthy(&self) -> bool {
        matches!(self, ComponentStatus::HealthyUntil(_))
    }

    fn describe(&self) -> String {
        match self {
            ComponentStatus::Starting => "starting".to_string(),
            ComponentStatus::HealthyUntil(until) => match until.format(&Rfc3339) {
                Ok(until) => format!("healthy until {until}"),
                Err(_) => "healthy".to_string(),
            },
            ComponentStatus::Unhealthy => "unhealthy".to_string(),
            ComponentStatus::Terminated(reason) => format!("terminated: {reason}"),
            ComponentStatus::Stalled => "stalled".to_string(),
        }
    }
}

type Components = Arc<Mutex<HashMap<String, ComponentStatus>>>;

fn lock(components: &Components) -> MutexGuard<'_, HashMap<String, ComponentStatus>> {
    // A poisoned map is still the best information we have
    match components.lock() {
        Ok(components) => components,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Point-in-time view of every component, usable as an axum response.
#[derive(Debug, Default)]
pub struct HealthStatus {
    /// True when at least one component registered and all of them are healthy
    pub healthy: bool,
    pub components: BTreeMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let components: BTreeMap<_, _> = self
            .components
            .iter()
            .map(|(name, status)| (name.clone(), status.describe()))
            .collect();
        (
            code,
            Json(json!({"healthy": self.healthy, "components": components})),
        )
            .into_response()
    }
}

/// Reporting side of one registered component. Cheap to clone, and usable
/// from the rdkafka callback threads since reporting never awaits.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Must be called more often than the deadline given at registration.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc() + self.deadline,
        ));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        let mut components = lock(&self.components);
        let current = components
            .entry(self.component.clone())
            .or_insert(ComponentStatus::Starting);
        if matches!(current, ComponentStatus::Terminated(_)) {
            return;
        }
        *current = status;
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        HealthRegistry {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Adds a component in the `Starting` state. It must report through the
    /// returned handle at least once per `deadline` to be considered live.
    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        lock(&self.components).insert(component.clone(), ComponentStatus::Starting);
        info!(registry = %self.name, %component, "registered health component");
        HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        }
    }

    pub fn get_status(&self) -> HealthStatus {
        let now = OffsetDateTime::now_utc();
        let components: BTreeMap<String, ComponentStatus> = lock(&self.components)
            .iter()
            .map(|(name, status)| (name.clone(), status.observed_at(now)))
            .collect();
        let healthy =
            !components.is_empty() && components.values().all(ComponentStatus::is_healthy);

        if !healthy {
            let failing: Vec<String> = components
                .iter()
                .filter(|(_, status)| !status.is_healthy())
                .map(|(name, status)| format!("{name}: {}", status.describe()))
                .collect();
            warn!(registry = %self.name, ?failing, "health check failed");
        }
        HealthStatus {
            healthy,
            components,
        }
    }
}
