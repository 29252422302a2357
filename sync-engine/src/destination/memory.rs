use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bail;
use crate::destination::sql::{Sql, SqlGenerator};
use crate::destination::{
    DestinationHandler, NO_SUFFIX, SOFT_RESET_SUFFIX, StorageOperation, TMP_TABLE_SUFFIX,
};
use crate::error::{ErrorKind, SyncResult};
use crate::state::destination::{DestinationState, MinimumDestinationState};
use crate::state::initial::{DestinationInitialStatus, InitialRawTableStatus};
use crate::types::{
    ColumnDefinition, ColumnId, ColumnType, GenerationId, RecordMessage, StreamConfig, StreamId,
    SyncMode,
};

/// Column holding the identifier of a staged record in final rows.
pub const RAW_ID_COLUMN: &str = "_raw_id";
/// Column holding the extraction time of the record in final rows.
pub const EXTRACTED_AT_COLUMN: &str = "_extracted_at";
/// Column holding the typing errors of the record in final rows.
pub const META_COLUMN: &str = "_meta";
/// Column holding the generation the record was produced by in final rows.
pub const GENERATION_ID_COLUMN: &str = "_generation_id";

/// A record as it sits in a raw stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRecord {
    pub raw_id: Uuid,
    pub extracted_at: DateTime<Utc>,
    /// Time the record was typed into a final table, `None` while unprocessed.
    pub loaded_at: Option<DateTime<Utc>>,
    pub generation_id: GenerationId,
    pub data: Value,
}

#[derive(Debug, Clone)]
struct FinalTable {
    columns: Vec<ColumnDefinition>,
    rows: Vec<Map<String, Value>>,
}

type TableKey = (StreamId, String);

#[derive(Debug)]
struct Inner<St> {
    namespaces: BTreeSet<String>,
    executed: Vec<String>,
    stages: HashMap<TableKey, Vec<StagedRecord>>,
    finals: HashMap<TableKey, FinalTable>,
    states: HashMap<StreamId, St>,
}

/// In-memory destination for testing and development purposes.
///
/// [`MemoryDestination`] keeps raw stages, typed final tables and destination states in memory and
/// implements both [`StorageOperation`] and [`DestinationHandler`]. Typing coerces raw values into
/// the configured column types, nulling values that cannot be cast. Deduplicated streams keep one
/// row per primary key, the one with the greatest cursor and extraction time.
///
/// Clones share the same underlying data, so a clone handed to the engine can be inspected by the
/// test that created it.
#[derive(Debug)]
pub struct MemoryDestination<St = MinimumDestinationState> {
    inner: Arc<Mutex<Inner<St>>>,
}

impl<St> Clone for MemoryDestination<St> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<St> MemoryDestination<St>
where
    St: DestinationState + Default,
{
    /// Creates a new empty memory destination.
    pub fn new() -> Self {
        let inner = Inner {
            namespaces: BTreeSet::new(),
            executed: Vec::new(),
            stages: HashMap::new(),
            finals: HashMap::new(),
            states: HashMap::new(),
        };

        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Returns the rows of the real final table of a stream, empty if the table does not exist.
    pub async fn final_rows(&self, stream_id: &StreamId) -> Vec<Map<String, Value>> {
        self.final_rows_with_suffix(stream_id, NO_SUFFIX).await
    }

    /// Returns the rows of the final table `suffix` of a stream.
    pub async fn final_rows_with_suffix(
        &self,
        stream_id: &StreamId,
        suffix: &str,
    ) -> Vec<Map<String, Value>> {
        let inner = self.inner.lock().await;
        inner
            .finals
            .get(&key(stream_id, suffix))
            .map(|table| table.rows.clone())
            .unwrap_or_default()
    }

    pub async fn final_table_exists(&self, stream_id: &StreamId, suffix: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.finals.contains_key(&key(stream_id, suffix))
    }

    /// Returns the records of stage `suffix` of a stream, `None` if the stage does not exist.
    pub async fn stage_records(
        &self,
        stream_id: &StreamId,
        suffix: &str,
    ) -> Option<Vec<StagedRecord>> {
        let inner = self.inner.lock().await;
        inner.stages.get(&key(stream_id, suffix)).cloned()
    }

    pub async fn destination_state(&self, stream_id: &StreamId) -> Option<St> {
        let inner = self.inner.lock().await;
        inner.states.get(stream_id).cloned()
    }

    /// Seeds the persisted state of a stream, as left by a previous sync.
    pub async fn set_destination_state(&self, stream_id: &StreamId, state: St) {
        let mut inner = self.inner.lock().await;
        inner.states.insert(stream_id.clone(), state);
    }

    pub async fn namespaces(&self) -> BTreeSet<String> {
        let inner = self.inner.lock().await;
        inner.namespaces.clone()
    }

    /// Returns every statement executed through [`DestinationHandler::execute`], in order.
    pub async fn executed_statements(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.executed.clone()
    }
}

impl<St> Default for MemoryDestination<St>
where
    St: DestinationState + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<St> StorageOperation for MemoryDestination<St>
where
    St: DestinationState + Default,
{
    async fn prepare_stage(&self, stream_id: &StreamId, suffix: &str, replace: bool) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;

        let stage = inner.stages.entry(key(stream_id, suffix)).or_default();
        if replace {
            stage.clear();
        }

        debug!(stream = %stream_id, table = stream_id.raw_table(suffix), replace, "prepared stage");

        Ok(())
    }

    async fn overwrite_stage(&self, stream_id: &StreamId, tmp_suffix: &str) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;

        let Some(records) = inner.stages.remove(&key(stream_id, tmp_suffix)) else {
            bail!(
                ErrorKind::DestinationStageMissing,
                "Stage to overwrite with does not exist",
                format!("Stage {} does not exist", stream_id.raw_table(tmp_suffix))
            );
        };

        info!(stream = %stream_id, records = records.len(), "overwriting stage");
        inner.stages.insert(key(stream_id, NO_SUFFIX), records);

        Ok(())
    }

    async fn transfer_from_temp_stage(&self, stream_id: &StreamId, tmp_suffix: &str) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;

        let Some(records) = inner.stages.remove(&key(stream_id, tmp_suffix)) else {
            return Ok(());
        };

        info!(stream = %stream_id, records = records.len(), "transferring records from temp stage");
        inner
            .stages
            .entry(key(stream_id, NO_SUFFIX))
            .or_default()
            .extend(records);

        Ok(())
    }

    async fn get_stage_generation(
        &self,
        stream_id: &StreamId,
        suffix: &str,
    ) -> SyncResult<Option<GenerationId>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .stages
            .get(&key(stream_id, suffix))
            .and_then(|records| records.first())
            .map(|record| record.generation_id))
    }

    async fn cleanup_stage(&self, stream_id: &StreamId) -> SyncResult<()> {
        debug!(stream = %stream_id, "nothing to clean up for in-memory stages");

        Ok(())
    }

    async fn write_to_stage(
        &self,
        stream: &StreamConfig,
        suffix: &str,
        records: Vec<RecordMessage>,
    ) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;

        let Some(stage) = inner.stages.get_mut(&key(&stream.id, suffix)) else {
            bail!(
                ErrorKind::DestinationStageMissing,
                "Stage to write to does not exist",
                format!("Stage {} does not exist", stream.id.raw_table(suffix))
            );
        };

        debug!(stream = %stream.id, records = records.len(), "writing records to stage");

        stage.extend(records.into_iter().map(|record| StagedRecord {
            raw_id: Uuid::new_v4(),
            extracted_at: record.emitted_at,
            loaded_at: None,
            generation_id: stream.generation_id,
            data: record.data,
        }));

        Ok(())
    }

    async fn create_final_table(&self, stream: &StreamConfig, suffix: &str, replace: bool) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;

        let table_key = key(&stream.id, suffix);
        if !replace && inner.finals.contains_key(&table_key) {
            bail!(
                ErrorKind::DestinationTableAlreadyExists,
                "Final table already exists",
                format!("Final table {} already exists", stream.id.final_table(suffix))
            );
        }

        info!(stream = %stream.id, table = stream.id.final_table(suffix), replace, "creating final table");
        inner.finals.insert(
            table_key,
            FinalTable {
                columns: stream.columns.clone(),
                rows: Vec::new(),
            },
        );

        Ok(())
    }

    async fn soft_reset_final_table(&self, stream: &StreamConfig) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;

        info!(stream = %stream.id, "soft resetting final table");

        let soft_reset_key = key(&stream.id, SOFT_RESET_SUFFIX);
        inner.finals.insert(
            soft_reset_key.clone(),
            FinalTable {
                columns: stream.columns.clone(),
                rows: Vec::new(),
            },
        );

        if let Some(stage) = inner.stages.get_mut(&key(&stream.id, NO_SUFFIX)) {
            for record in stage.iter_mut() {
                record.loaded_at = None;
            }
        }

        inner.type_and_dedupe(stream, None, SOFT_RESET_SUFFIX)?;

        if let Some(table) = inner.finals.remove(&soft_reset_key) {
            inner.finals.insert(key(&stream.id, NO_SUFFIX), table);
        }

        Ok(())
    }

    async fn overwrite_final_table(&self, stream_id: &StreamId, tmp_suffix: &str) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;

        let Some(table) = inner.finals.remove(&key(stream_id, tmp_suffix)) else {
            bail!(
                ErrorKind::DestinationTableMissing,
                "Final table to overwrite with does not exist",
                format!("Final table {} does not exist", stream_id.final_table(tmp_suffix))
            );
        };

        info!(stream = %stream_id, rows = table.rows.len(), "overwriting final table");
        inner.finals.insert(key(stream_id, NO_SUFFIX), table);

        Ok(())
    }

    async fn type_and_dedupe(
        &self,
        stream: &StreamConfig,
        max_processed_timestamp: Option<DateTime<Utc>>,
        final_suffix: &str,
    ) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        inner.type_and_dedupe(stream, max_processed_timestamp, final_suffix)
    }
}

impl<St> DestinationHandler for MemoryDestination<St>
where
    St: DestinationState + Default,
{
    type State = St;

    async fn execute(&self, sql: Sql) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;

        for transaction in sql.transactions() {
            for statement in transaction {
                if let Some(namespace) = statement.strip_prefix("CREATE SCHEMA IF NOT EXISTS ") {
                    inner.namespaces.insert(namespace.trim().to_string());
                }
                inner.executed.push(statement.clone());
            }
        }

        Ok(())
    }

    async fn gather_initial_state(
        &self,
        streams: &[StreamConfig],
    ) -> SyncResult<Vec<DestinationInitialStatus<St>>> {
        let inner = self.inner.lock().await;

        let statuses = streams
            .iter()
            .map(|stream| {
                let final_table = inner.finals.get(&key(&stream.id, NO_SUFFIX));

                DestinationInitialStatus {
                    stream_config: stream.clone(),
                    is_final_table_present: final_table.is_some(),
                    is_final_table_empty: final_table.is_none_or(|table| table.rows.is_empty()),
                    is_schema_mismatch: final_table
                        .is_some_and(|table| table.columns != stream.columns),
                    initial_raw_table_status: inner.raw_table_status(&stream.id, NO_SUFFIX),
                    initial_temp_raw_table_status: inner
                        .raw_table_status(&stream.id, TMP_TABLE_SUFFIX),
                    destination_state: inner.states.get(&stream.id).cloned().unwrap_or_default(),
                }
            })
            .collect();

        Ok(statuses)
    }

    async fn commit_destination_states(&self, states: HashMap<StreamId, St>) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;

        debug!(streams = states.len(), "committing destination states");
        inner.states.extend(states);

        Ok(())
    }
}

impl<St> Inner<St> {
    fn raw_table_status(&self, stream_id: &StreamId, suffix: &str) -> InitialRawTableStatus {
        let Some(records) = self.stages.get(&key(stream_id, suffix)) else {
            return InitialRawTableStatus::default();
        };

        InitialRawTableStatus {
            raw_table_exists: true,
            has_unprocessed_records: records.iter().any(|record| record.loaded_at.is_none()),
            max_processed_timestamp: records
                .iter()
                .filter(|record| record.loaded_at.is_some())
                .map(|record| record.extracted_at)
                .max(),
        }
    }

    fn type_and_dedupe(
        &mut self,
        stream: &StreamConfig,
        max_processed_timestamp: Option<DateTime<Utc>>,
        final_suffix: &str,
    ) -> SyncResult<()> {
        let Some(mut table) = self.finals.remove(&key(&stream.id, final_suffix)) else {
            bail!(
                ErrorKind::DestinationTableMissing,
                "Final table to type into does not exist",
                format!("Final table {} does not exist", stream.id.final_table(final_suffix))
            );
        };

        let now = Utc::now();
        let mut typed = 0usize;
        if let Some(stage) = self.stages.get_mut(&key(&stream.id, NO_SUFFIX)) {
            for record in stage.iter_mut() {
                let is_new = max_processed_timestamp.is_none_or(|ts| record.extracted_at > ts);
                if record.loaded_at.is_some() || !is_new {
                    continue;
                }

                let row = type_record(&table.columns, record);
                match stream.sync_mode {
                    SyncMode::AppendDedup => upsert(&mut table.rows, row, stream),
                    SyncMode::Append | SyncMode::Overwrite => table.rows.push(row),
                }

                record.loaded_at = Some(now);
                typed += 1;
            }
        }

        info!(
            stream = %stream.id,
            table = stream.id.final_table(final_suffix),
            records = typed,
            "typed and deduped records"
        );
        self.finals.insert(key(&stream.id, final_suffix), table);

        Ok(())
    }
}

fn key(stream_id: &StreamId, suffix: &str) -> TableKey {
    (stream_id.clone(), suffix.to_string())
}

fn type_record(columns: &[ColumnDefinition], record: &StagedRecord) -> Map<String, Value> {
    let mut row = Map::new();
    let mut changes = Vec::new();

    for column in columns {
        let raw = record
            .data
            .get(&column.id.original_name)
            .cloned()
            .unwrap_or(Value::Null);

        let value = match coerce(column.column_type, &raw) {
            Some(value) => value,
            None => {
                changes.push(json!({
                    "field": column.id.name,
                    "change": "NULLED",
                    "reason": "DESTINATION_TYPECAST_ERROR",
                }));
                Value::Null
            }
        };
        row.insert(column.id.name.clone(), value);
    }

    row.insert(RAW_ID_COLUMN.to_string(), Value::String(record.raw_id.to_string()));
    row.insert(
        EXTRACTED_AT_COLUMN.to_string(),
        Value::String(format_timestamp(record.extracted_at)),
    );
    row.insert(META_COLUMN.to_string(), json!({ "changes": changes }));
    row.insert(GENERATION_ID_COLUMN.to_string(), json!(record.generation_id));

    row
}

/// Casts a raw value into `column_type`, returning `None` when the cast is impossible.
fn coerce(column_type: ColumnType, value: &Value) -> Option<Value> {
    if value.is_null() {
        return Some(Value::Null);
    }

    match column_type {
        ColumnType::Json => Some(value.clone()),
        ColumnType::String => match value {
            Value::String(_) => Some(value.clone()),
            other => Some(Value::String(other.to_string())),
        },
        ColumnType::Integer => match value {
            Value::Number(number) if number.is_i64() => Some(value.clone()),
            Value::String(text) => text.trim().parse::<i64>().ok().map(Value::from),
            _ => None,
        },
        ColumnType::Number => match value {
            Value::Number(_) => Some(value.clone()),
            Value::String(text) => text.trim().parse::<f64>().ok().map(Value::from),
            _ => None,
        },
        ColumnType::Boolean => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::String(text) => text.trim().parse::<bool>().ok().map(Value::Bool),
            _ => None,
        },
        ColumnType::Timestamp => match value {
            Value::String(text) => DateTime::parse_from_rfc3339(text.trim())
                .ok()
                .map(|ts| Value::String(format_timestamp(ts.with_timezone(&Utc)))),
            _ => None,
        },
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Inserts `row` or replaces the row with the same primary key if `row` is not older.
fn upsert(rows: &mut Vec<Map<String, Value>>, row: Map<String, Value>, stream: &StreamConfig) {
    let primary_key = |row: &Map<String, Value>| -> Vec<Value> {
        stream
            .primary_key
            .iter()
            .map(|column| row.get(&column.name).cloned().unwrap_or(Value::Null))
            .collect()
    };

    let row_key = primary_key(&row);
    match rows.iter_mut().find(|existing| primary_key(existing) == row_key) {
        Some(existing) => {
            if recency(&row, existing, stream.cursor.as_ref()) != Ordering::Less {
                *existing = row;
            }
        }
        None => rows.push(row),
    }
}

/// Orders two rows by cursor, then by extraction time.
fn recency(
    left: &Map<String, Value>,
    right: &Map<String, Value>,
    cursor: Option<&ColumnId>,
) -> Ordering {
    let by_cursor = cursor
        .map(|cursor| {
            compare_values(
                left.get(&cursor.name).unwrap_or(&Value::Null),
                right.get(&cursor.name).unwrap_or(&Value::Null),
            )
        })
        .unwrap_or(Ordering::Equal);

    by_cursor.then_with(|| {
        compare_values(
            left.get(EXTRACTED_AT_COLUMN).unwrap_or(&Value::Null),
            right.get(EXTRACTED_AT_COLUMN).unwrap_or(&Value::Null),
        )
    })
}

fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(left), Value::Number(right)) => {
            let left = left.as_f64().unwrap_or_default();
            let right = right.as_f64().unwrap_or_default();
            left.partial_cmp(&right).unwrap_or(Ordering::Equal)
        }
        (Value::String(left), Value::String(right)) => left.cmp(right),
        (Value::Bool(left), Value::Bool(right)) => left.cmp(right),
        (left, right) => left.to_string().cmp(&right.to_string()),
    }
}

/// [`SqlGenerator`] matching the naming rules of [`MemoryDestination`].
///
/// Column names are lowercased. Raw tables of every stream live in the raw namespace and are named
/// `{namespace}_raw__stream_{name}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemorySqlGenerator;

impl SqlGenerator for MemorySqlGenerator {
    fn build_stream_id(&self, namespace: &str, name: &str, raw_namespace: &str) -> StreamId {
        StreamId {
            final_namespace: namespace.to_string(),
            final_name: name.to_string(),
            raw_namespace: raw_namespace.to_string(),
            raw_name: format!("{namespace}_raw__stream_{name}"),
            original_namespace: namespace.to_string(),
            original_name: name.to_string(),
        }
    }

    fn build_column_id(&self, name: &str) -> ColumnId {
        ColumnId {
            name: name.to_lowercase(),
            original_name: name.to_string(),
        }
    }

    fn create_schema(&self, namespace: &str) -> Sql {
        Sql::of(format!("CREATE SCHEMA IF NOT EXISTS {namespace}"))
    }
}
