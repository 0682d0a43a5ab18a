//! In-memory [`Store`] used by tests and local dry runs.
//!
//! Mirrors the behaviour the engine relies on from the real store: pages are
//! limited before filters run, secondary indexes are sparse, cursors are the
//! key attributes of the last evaluated item, and a batch may not touch the
//! same key twice.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::trace;

use crate::StoreError;
use crate::condition::ReadRequest;
use crate::record::{Cursor, PARTITION_KEY, Record, RecordKey, SORT_KEY};
use crate::store::{MAX_BATCH_WRITE, Page, Store, WriteOp};

#[derive(Debug, Clone)]
struct IndexDef {
    partition_attr: String,
    sort_attr: Option<String>,
}

/// Position of an item in a table or index, used for ordering and cursors.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Position {
    index_partition: String,
    index_sort: String,
    key: RecordKey,
}

fn render(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Thread-safe in-memory tables with optional sparse secondary indexes.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, BTreeMap<RecordKey, Record>>>,
    indexes: HashMap<(String, String), IndexDef>,
    rejected_keys: RwLock<HashSet<RecordKey>>,
    read_calls: AtomicUsize,
    write_calls: AtomicUsize,
    failing_reads: AtomicUsize,
    failing_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a secondary index. Items without `partition_attr` are not in it.
    pub fn with_index(
        mut self,
        table: impl Into<String>,
        index: impl Into<String>,
        partition_attr: impl Into<String>,
        sort_attr: Option<&str>,
    ) -> Self {
        self.indexes.insert(
            (table.into(), index.into()),
            IndexDef {
                partition_attr: partition_attr.into(),
                sort_attr: sort_attr.map(str::to_string),
            },
        );
        self
    }

    /// Insert or replace a record directly, bypassing call counters.
    pub async fn insert(&self, table: &str, record: Record) -> Result<(), StoreError> {
        let key = record.require_key()?;
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .insert(key, record);
        Ok(())
    }

    pub async fn insert_all(
        &self,
        table: &str,
        records: impl IntoIterator<Item = Record>,
    ) -> Result<(), StoreError> {
        for record in records {
            self.insert(table, record).await?;
        }
        Ok(())
    }

    /// Every record of a table, in key order.
    pub async fn records(&self, table: &str) -> Vec<Record> {
        self.tables
            .read()
            .await
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn len(&self, table: &str) -> usize {
        self.tables.read().await.get(table).map_or(0, BTreeMap::len)
    }

    /// Number of `read_page` calls received, including failed ones.
    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    /// Number of `batch_write` calls received, including failed ones.
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Make the next `n` reads fail with [`StoreError::Unavailable`].
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` batch writes fail with [`StoreError::Unavailable`].
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Permanently reject any batch that touches `key`.
    pub async fn reject_key(&self, key: RecordKey) {
        self.rejected_keys.write().await.insert(key);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn position(index: Option<&IndexDef>, key: RecordKey, attrs: &Map<String, Value>) -> Position {
        match index {
            None => Position {
                index_partition: String::new(),
                index_sort: String::new(),
                key,
            },
            Some(def) => Position {
                index_partition: render(attrs.get(&def.partition_attr)),
                index_sort: def
                    .sort_attr
                    .as_ref()
                    .map(|attr| render(attrs.get(attr)))
                    .unwrap_or_default(),
                key,
            },
        }
    }

    fn cursor_position(index: Option<&IndexDef>, cursor: &Cursor) -> Result<Position, StoreError> {
        let key = match (cursor.get_str(PARTITION_KEY), cursor.get_str(SORT_KEY)) {
            (Some(pk), Some(sk)) => RecordKey::new(pk, sk),
            _ => {
                return Err(StoreError::InvalidRequest(format!(
                    "cursor {} is missing primary key attributes",
                    cursor
                )));
            }
        };
        Ok(Self::position(index, key, cursor.attributes()))
    }

    fn cursor_for(index: Option<&IndexDef>, record: &Record, key: &RecordKey) -> Cursor {
        let mut attrs = Map::new();
        attrs.insert(PARTITION_KEY.to_string(), Value::String(key.pk.clone()));
        attrs.insert(SORT_KEY.to_string(), Value::String(key.sk.clone()));
        if let Some(def) = index {
            let index_attrs = std::iter::once(&def.partition_attr).chain(def.sort_attr.as_ref());
            for attr in index_attrs {
                if let Some(value) = record.get(attr) {
                    attrs.insert(attr.clone(), value.clone());
                }
            }
        }
        Cursor::from_attributes(attrs)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read_page(
        &self,
        request: &ReadRequest,
        start: Option<&Cursor>,
    ) -> Result<Page, StoreError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_reads) {
            return Err(StoreError::Unavailable("injected read failure".into()));
        }

        let index = match &request.index {
            None => None,
            Some(name) => Some(
                self.indexes
                    .get(&(request.table.clone(), name.clone()))
                    .ok_or_else(|| {
                        StoreError::InvalidRequest(format!(
                            "table {} has no index {}",
                            request.table, name
                        ))
                    })?,
            ),
        };

        let tables = self.tables.read().await;
        let mut candidates: Vec<(Position, &Record)> = tables
            .get(&request.table)
            .map(|table| {
                table
                    .iter()
                    .filter(|(_, record)| index.is_none_or(|def| record.contains(&def.partition_attr)))
                    .filter(|(_, record)| {
                        request.key.as_ref().is_none_or(|key| key.matches(record))
                    })
                    .map(|(key, record)| {
                        (Self::position(index, key.clone(), record.attributes()), record)
                    })
                    .collect()
            })
            .unwrap_or_default();
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let after = match start {
            Some(cursor) => Some(Self::cursor_position(index, cursor)?),
            None => None,
        };
        let remaining: Vec<(Position, &Record)> = candidates
            .into_iter()
            .filter(|(pos, _)| {
                after
                    .as_ref()
                    .is_none_or(|after| pos.cmp(after) == CmpOrdering::Greater)
            })
            .collect();

        let limit = request.limit.map_or(usize::MAX, |l| l.max(1) as usize);
        let more = remaining.len() > limit;
        let evaluated = &remaining[..remaining.len().min(limit)];

        let cursor = match evaluated.last() {
            Some((pos, record)) if more => Some(Self::cursor_for(index, record, &pos.key)),
            _ => None,
        };
        let items: Vec<Record> = evaluated
            .iter()
            .map(|(_, record)| *record)
            .filter(|record| request.filter.as_ref().is_none_or(|f| f.matches(record)))
            .cloned()
            .collect();

        trace!(
            table = %request.table,
            evaluated = evaluated.len(),
            returned = items.len(),
            "memory read_page"
        );
        Ok(Page { items, cursor })
    }

    async fn batch_write(&self, table: &str, ops: &[WriteOp]) -> Result<(), StoreError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if ops.len() > MAX_BATCH_WRITE {
            return Err(StoreError::BatchTooLarge {
                size: ops.len(),
                max: MAX_BATCH_WRITE,
            });
        }
        if Self::take_failure(&self.failing_writes) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }

        let mut seen = HashSet::new();
        for op in ops {
            let key = match op {
                WriteOp::Put(record) => record.require_key()?,
                WriteOp::Delete(key) => key.clone(),
            };
            if self.rejected_keys.read().await.contains(&key) {
                return Err(StoreError::Backend(format!("write rejected for {}", key)));
            }
            if !seen.insert(key.clone()) {
                return Err(StoreError::InvalidRequest(format!(
                    "batch contains duplicate key {}",
                    key
                )));
            }
        }

        let mut tables = self.tables.write().await;
        let entries = tables.entry(table.to_string()).or_default();
        for op in ops {
            match op {
                WriteOp::Put(record) => {
                    let key = record.require_key()?;
                    entries.insert(key, record.clone());
                }
                WriteOp::Delete(key) => {
                    entries.remove(key);
                }
            }
        }
        Ok(())
    }

    async fn get(&self, table: &str, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .get(table)
            .and_then(|t| t.get(key))
            .cloned())
    }
}
