//! Change-data-capture stream of projects, consumed by the broker binary.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::RegistrationError;
use crate::metrics::ConsumerMetrics;
use crate::registry::{Listen, SubscriptionRegistry};

pub const PROJECT_ENTITY: &str = "project";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectModel {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

pub fn handle_project(
    metrics: &dyn ConsumerMetrics,
    project: ProjectModel,
) -> anyhow::Result<()> {
    info!(project_id = %project.id, name = %project.name, "project created");
    metrics.entity_created(PROJECT_ENTITY);
    Ok(())
}

pub fn register(
    registry: &mut SubscriptionRegistry,
    topic: &str,
    metrics: Arc<dyn ConsumerMetrics>,
) -> Result<(), RegistrationError> {
    registry.register(Listen::topic(topic), move |project: ProjectModel| {
        let metrics = metrics.clone();
        async move { handle_project(metrics.as_ref(), project) }
    })
}
