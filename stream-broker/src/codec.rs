//! Schema-registry backed avro encoding.
//!
//! Payloads use the single-object framing understood by the Confluent
//! serializers: a zero magic byte, the writer schema id as a big-endian
//! u32, then the avro binary body.
//!
//! Serializers are resolved once per topic against the registry's latest
//! version and cached for the life of the codec; a newer schema version
//! registered later is not picked up. Decoding never looks at "latest":
//! the writer schema is resolved from the id embedded in the payload.
use std::any::type_name;
use std::sync::Arc;

use apache_avro::types::Value;
use apache_avro::Schema;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

use crate::error::{DecodeError, ProduceError, RegistryError};
use crate::record::{commit_set, DecodedBatch, RawRecord};
use crate::schema_registry::{RegisteredSchema, SchemaRegistry};

pub const MAGIC_BYTE: u8 = 0;
const HEADER_LEN: usize = 5;

/// Converts a message to an avro value, before any schema is involved.
pub fn to_value<T: Serialize + ?Sized>(topic: &str, message: &T) -> Result<Value, ProduceError> {
    apache_avro::to_value(message).map_err(|error| ProduceError::SchemaMismatch {
        topic: topic.to_owned(),
        error,
    })
}

/// Prepends the schema header to an avro body.
pub fn frame(schema_id: u32, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(HEADER_LEN + body.len());
    payload.push(MAGIC_BYTE);
    payload.extend_from_slice(&schema_id.to_be_bytes());
    payload.extend_from_slice(body);
    payload
}

/// Splits a framed payload into its writer schema id and avro body.
pub fn unframe(payload: &[u8]) -> Result<(u32, &[u8]), DecodeError> {
    if payload.len() < HEADER_LEN {
        return Err(DecodeError::Truncated(payload.len()));
    }
    if payload[0] != MAGIC_BYTE {
        return Err(DecodeError::UnknownMagicByte(payload[0]));
    }
    let id = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
    Ok((id, &payload[HEADER_LEN..]))
}

fn parse_schema(registered: &RegisteredSchema) -> Result<Schema, RegistryError> {
    Schema::parse_str(&registered.schema).map_err(|error| RegistryError::InvalidSchema {
        id: registered.id,
        error,
    })
}

/// Encodes messages against one registered schema version.
#[derive(Debug)]
pub struct AvroSerializer {
    schema_id: u32,
    schema: Schema,
}

impl AvroSerializer {
    pub fn new(registered: &RegisteredSchema) -> Result<Self, RegistryError> {
        Ok(AvroSerializer {
            schema_id: registered.id,
            schema: parse_schema(registered)?,
        })
    }

    pub fn schema_id(&self) -> u32 {
        self.schema_id
    }

    pub fn serialize(&self, value: Value) -> Result<Vec<u8>, apache_avro::Error> {
        let value = value.resolve(&self.schema)?;
        let body = apache_avro::to_avro_datum(&self.schema, value)?;
        Ok(frame(self.schema_id, &body))
    }
}

pub struct SchemaCodec {
    registry: Arc<dyn SchemaRegistry>,
    serializers: DashMap<String, Arc<AvroSerializer>>,
    writer_schemas: DashMap<u32, Arc<Schema>>,
}

impl SchemaCodec {
    pub fn new(registry: Arc<dyn SchemaRegistry>) -> Self {
        SchemaCodec {
            registry,
            serializers: DashMap::new(),
            writer_schemas: DashMap::new(),
        }
    }

    /// Returns the cached serializer for `topic`, resolving the latest schema on a miss.
    ///
    /// Concurrent misses may both hit the registry; the last insert wins, which is harmless
    /// since both resolved the same subject.
    pub async fn serializer(&self, topic: &str) -> Result<Arc<AvroSerializer>, ProduceError> {
        let cached = self.serializers.get(topic).map(|entry| entry.value().clone());
        if let Some(serializer) = cached {
            return Ok(serializer);
        }

        let unavailable = |error| ProduceError::SchemaUnavailable {
            topic: topic.to_owned(),
            error,
        };
        let registered = self.registry.latest(topic).await.map_err(unavailable)?;
        let serializer = Arc::new(AvroSerializer::new(&registered).map_err(unavailable)?);
        debug!(
            topic,
            schema_id = serializer.schema_id(),
            "cached serializer for topic"
        );
        self.serializers
            .insert(topic.to_owned(), serializer.clone());
        Ok(serializer)
    }

    pub async fn encode<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        message: &T,
    ) -> Result<Vec<u8>, ProduceError> {
        let value = to_value(topic, message)?;
        self.encode_value(topic, value).await
    }

    /// Encodes an already converted message with the topic's latest schema.
    pub async fn encode_value(&self, topic: &str, value: Value) -> Result<Vec<u8>, ProduceError> {
        let serializer = self.serializer(topic).await?;
        serializer.serialize(value).map_err(|error| {
            error!(
                topic,
                schema_id = serializer.schema_id(),
                "message does not match schema: {}",
                error
            );
            ProduceError::SchemaMismatch {
                topic: topic.to_owned(),
                error,
            }
        })
    }

    async fn writer_schema(&self, id: u32) -> Result<Arc<Schema>, DecodeError> {
        let cached = self.writer_schemas.get(&id).map(|entry| entry.value().clone());
        if let Some(schema) = cached {
            return Ok(schema);
        }

        let unavailable = |error| DecodeError::SchemaUnavailable { id, error };
        let registered = self.registry.by_id(id).await.map_err(unavailable)?;
        let schema = Arc::new(parse_schema(&registered).map_err(unavailable)?);
        self.writer_schemas.insert(id, schema.clone());
        Ok(schema)
    }

    /// Decodes one framed payload into `T` using the writer schema it names.
    pub async fn decode<T: DeserializeOwned>(&self, payload: Option<&[u8]>) -> Result<T, DecodeError> {
        let payload = payload.ok_or(DecodeError::EmptyPayload)?;
        let (id, mut body) = unframe(payload)?;
        let schema = self.writer_schema(id).await?;

        let value = apache_avro::from_avro_datum(&schema, &mut body, None)
            .map_err(|error| DecodeError::Avro { id, error })?;
        apache_avro::from_value::<T>(&value).map_err(|error| DecodeError::TargetType {
            target: type_name::<T>(),
            error,
        })
    }

    /// Decodes a buffer in arrival order, stopping at the first record that fails.
    pub async fn decode_batch<T: DeserializeOwned>(
        &self,
        records: &[RawRecord],
    ) -> Result<DecodedBatch<T>, (usize, DecodeError)> {
        let mut items = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            match self.decode::<T>(record.value.as_deref()).await {
                Ok(item) => items.push(item),
                Err(error) => {
                    error!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        "deserialization error: {}",
                        error
                    );
                    return Err((index, error));
                }
            }
        }
        Ok(DecodedBatch::new(items, commit_set(records)))
    }
}
