use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::bail;
use crate::destination::sql::SqlGenerator;
use crate::error::{ErrorKind, SyncResult};
use crate::types::{
    ColumnDefinition, ColumnType, GenerationId, StreamConfig, StreamDescriptor, StreamId, SyncMode,
};

/// A column as declared by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfiguredColumn {
    pub name: String,
    pub column_type: ColumnType,
}

/// A stream as configured by the platform, before destination naming is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfiguredStream {
    pub descriptor: StreamDescriptor,
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub cursor: Option<String>,
    pub columns: Vec<ConfiguredColumn>,
    #[serde(default)]
    pub generation_id: GenerationId,
    #[serde(default)]
    pub minimum_generation_id: GenerationId,
    #[serde(default)]
    pub sync_id: i64,
}

/// The set of streams taking part in a sync.
#[derive(Debug, Clone)]
pub struct Catalog {
    streams: Vec<StreamConfig>,
    by_descriptor: HashMap<(String, String), usize>,
    default_namespace: String,
}

impl Catalog {
    /// Resolves configured streams into [`StreamConfig`]s using the generator's naming rules.
    ///
    /// Streams without a namespace are placed in `default_namespace`.
    pub fn parse(
        configured: Vec<ConfiguredStream>,
        generator: &dyn SqlGenerator,
        raw_namespace: &str,
        default_namespace: &str,
    ) -> SyncResult<Self> {
        let streams = configured
            .into_iter()
            .map(|stream| {
                let namespace = stream
                    .descriptor
                    .namespace
                    .as_deref()
                    .unwrap_or(default_namespace);

                let find_column = |name: &str| generator.build_column_id(name);

                StreamConfig {
                    id: generator.build_stream_id(
                        namespace,
                        &stream.descriptor.name,
                        raw_namespace,
                    ),
                    sync_mode: stream.sync_mode,
                    primary_key: stream.primary_key.iter().map(|name| find_column(name)).collect(),
                    cursor: stream.cursor.as_deref().map(find_column),
                    columns: stream
                        .columns
                        .iter()
                        .map(|column| ColumnDefinition {
                            id: find_column(&column.name),
                            column_type: column.column_type,
                        })
                        .collect(),
                    generation_id: stream.generation_id,
                    minimum_generation_id: stream.minimum_generation_id,
                    sync_id: stream.sync_id,
                }
            })
            .collect();

        Self::new(streams, default_namespace)
    }

    /// Builds a catalog from resolved stream configurations.
    ///
    /// Fails if a stream configuration is invalid or two streams share the same identity.
    pub fn new(streams: Vec<StreamConfig>, default_namespace: &str) -> SyncResult<Self> {
        let mut by_descriptor = HashMap::with_capacity(streams.len());

        for (index, stream) in streams.iter().enumerate() {
            stream.validate()?;

            let key = (
                stream.id.original_namespace.clone(),
                stream.id.original_name.clone(),
            );
            if by_descriptor.insert(key, index).is_some() {
                bail!(
                    ErrorKind::ConfigError,
                    "Duplicate stream in catalog",
                    format!("Stream {} appears more than once in the catalog", stream.id)
                );
            }
        }

        Ok(Self {
            streams,
            by_descriptor,
            default_namespace: default_namespace.to_string(),
        })
    }

    pub fn streams(&self) -> &[StreamConfig] {
        &self.streams
    }

    pub fn stream_ids(&self) -> impl Iterator<Item = &StreamId> {
        self.streams.iter().map(|stream| &stream.id)
    }

    /// Resolves a wire identity to its stream configuration.
    pub fn stream(&self, descriptor: &StreamDescriptor) -> SyncResult<&StreamConfig> {
        let namespace = descriptor
            .namespace
            .as_deref()
            .unwrap_or(&self.default_namespace);

        match self
            .by_descriptor
            .get(&(namespace.to_string(), descriptor.name.clone()))
        {
            Some(index) => Ok(&self.streams[*index]),
            None => bail!(
                ErrorKind::UnknownStream,
                "Stream not in catalog",
                format!("Received a message for stream {descriptor} which is not in the catalog")
            ),
        }
    }

    pub fn stream_by_id(&self, id: &StreamId) -> Option<&StreamConfig> {
        self.by_descriptor
            .get(&(id.original_namespace.clone(), id.original_name.clone()))
            .map(|index| &self.streams[*index])
    }
}
