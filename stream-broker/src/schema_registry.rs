use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::error::RegistryError;

/// A schema as stored in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegisteredSchema {
    pub id: u32,
    #[serde(default)]
    pub version: Option<i32>,
    pub schema: String,
}

/// Remote lookup of avro schemas, by subject ("latest") or by embedded id.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    async fn latest(&self, subject: &str) -> Result<RegisteredSchema, RegistryError>;
    async fn by_id(&self, id: u32) -> Result<RegisteredSchema, RegistryError>;
}

#[derive(Deserialize)]
struct SchemaById {
    schema: String,
}

/// Client for the Confluent-compatible schema registry REST API.
#[derive(Clone)]
pub struct HttpSchemaRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSchemaRegistry {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .user_agent("stream-broker")
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    async fn get(&self, resource: String) -> Result<reqwest::Response, RegistryError> {
        let url = format!("{}{}", self.base_url, resource);
        debug!(%url, "querying schema registry");

        let response = self
            .client
            .get(url)
            .header("accept", "application/vnd.schemaregistry.v1+json")
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(resource)),
            status => Err(RegistryError::Status {
                resource,
                status: status.as_u16(),
            }),
        }
    }
}

#[async_trait]
impl SchemaRegistry for HttpSchemaRegistry {
    async fn latest(&self, subject: &str) -> Result<RegisteredSchema, RegistryError> {
        let response = self
            .get(format!("/subjects/{subject}/versions/latest"))
            .await?;
        Ok(response.json::<RegisteredSchema>().await?)
    }

    async fn by_id(&self, id: u32) -> Result<RegisteredSchema, RegistryError> {
        let response = self.get(format!("/schemas/ids/{id}")).await?;
        let body = response.json::<SchemaById>().await?;
        Ok(RegisteredSchema {
            id,
            version: None,
            schema: body.schema,
        })
    }
}
