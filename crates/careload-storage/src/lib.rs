//! Object storage, key-value table and notification backends for careload.
//!
//! Each external collaborator sits behind a trait so the load pipeline can run against the
//! local filesystem in production-like runs and against in-memory stores in tests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use careload_core::{NotifyError, RetrievalError, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "careload-storage";

/// Upper bound on item operations sent to a table store in one round trip.
pub const MAX_BATCH_ITEMS: usize = 25;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub location: String,
    pub key: String,
    pub absolute_path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, location: &str, key: &str) -> Result<Vec<u8>, RetrievalError>;

    async fn put(
        &self,
        location: &str,
        key: &str,
        bytes: &[u8],
    ) -> Result<StoredObject, RetrievalError>;
}

/// Object store laid out as `<root>/<location>/<key>` on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, location: &str, key: &str) -> Result<PathBuf, RetrievalError> {
        let relative = Path::new(location).join(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if location.is_empty() || key.is_empty() || escapes {
            return Err(RetrievalError::Malformed {
                key: format!("{location}/{key}"),
                reason: "object path must be relative and stay inside its location".to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, location: &str, key: &str) -> Result<Vec<u8>, RetrievalError> {
        let path = self.resolve(location, key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(RetrievalError::NotFound {
                    location: location.to_string(),
                    key: key.to_string(),
                })
            }
            Err(source) => Err(RetrievalError::Io {
                location: location.to_string(),
                key: key.to_string(),
                source,
            }),
        }
    }

    /// Writes through a temp file in the destination directory, then renames over the target.
    async fn put(
        &self,
        location: &str,
        key: &str,
        bytes: &[u8],
    ) -> Result<StoredObject, RetrievalError> {
        let absolute_path = self.resolve(location, key)?;
        let io_err = |source: std::io::Error| RetrievalError::Io {
            location: location.to_string(),
            key: key.to_string(),
            source,
        };

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).await.map_err(io_err)?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let written = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            drop(file);
            fs::rename(&temp_path, &absolute_path).await
        }
        .await;

        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(err));
        }

        Ok(StoredObject {
            location: location.to_string(),
            key: key.to_string(),
            absolute_path,
            content_hash: sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }
}

/// A stored row: attribute name to text value.
pub type Item = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put(Item),
    Delete(String),
}

#[async_trait]
pub trait TableStore: Send + Sync {
    /// All primary-key values currently in `table`. A missing table scans as empty.
    async fn scan_keys(&self, table: &str, key_attr: &str) -> Result<Vec<String>, StoreError>;

    /// Applies `ops` in order. Not atomic: an error leaves earlier ops applied.
    async fn batch_write(
        &self,
        table: &str,
        key_attr: &str,
        ops: Vec<WriteOp>,
    ) -> Result<(), StoreError>;

    async fn get_item(
        &self,
        table: &str,
        key_attr: &str,
        key: &str,
    ) -> Result<Option<Item>, StoreError>;

    async fn put_item(&self, table: &str, key_attr: &str, item: Item) -> Result<(), StoreError> {
        self.batch_write(table, key_attr, vec![WriteOp::Put(item)])
            .await
    }
}

fn apply_ops(
    rows: &mut BTreeMap<String, Item>,
    table: &str,
    key_attr: &str,
    ops: Vec<WriteOp>,
) -> Result<(), StoreError> {
    for op in ops {
        match op {
            WriteOp::Put(item) => {
                let key = item
                    .get(key_attr)
                    .cloned()
                    .ok_or_else(|| {
                        StoreError::Backend(format!(
                            "put into {table} is missing key attribute {key_attr}"
                        ))
                    })?;
                rows.insert(key, item);
            }
            WriteOp::Delete(key) => {
                rows.remove(&key);
            }
        }
    }
    Ok(())
}

/// Process-local table store; also records the size of every batch it receives.
#[derive(Debug, Default)]
pub struct InMemoryTableStore {
    tables: Mutex<HashMap<String, BTreeMap<String, Item>>>,
    batch_sizes: Mutex<Vec<usize>>,
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self, table: &str) -> BTreeMap<String, Item> {
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().await.clone()
    }
}

#[async_trait]
impl TableStore for InMemoryTableStore {
    async fn scan_keys(&self, table: &str, _key_attr: &str) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .get(table)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn batch_write(
        &self,
        table: &str,
        key_attr: &str,
        ops: Vec<WriteOp>,
    ) -> Result<(), StoreError> {
        self.batch_sizes.lock().await.push(ops.len());
        let mut tables = self.tables.lock().await;
        let rows = tables.entry(table.to_string()).or_default();
        apply_ops(rows, table, key_attr, ops)
    }

    async fn get_item(
        &self,
        table: &str,
        _key_attr: &str,
        key: &str,
    ) -> Result<Option<Item>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.get(table).and_then(|rows| rows.get(key)).cloned())
    }
}

/// Table store keeping one JSON document (`{key: item}`) per table under `root`.
#[derive(Debug, Clone)]
pub struct FileTableStore {
    root: PathBuf,
}

impl FileTableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize_file_stem(table)))
    }

    async fn load(&self, table: &str) -> Result<BTreeMap<String, Item>, StoreError> {
        let path = self.table_path(table);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new())
            }
            Err(source) => {
                return Err(StoreError::Io {
                    table: table.to_string(),
                    source,
                })
            }
        };
        serde_json::from_str(&text).map_err(|err| StoreError::Corrupt {
            table: table.to_string(),
            reason: err.to_string(),
        })
    }

    async fn save(&self, table: &str, rows: &BTreeMap<String, Item>) -> Result<(), StoreError> {
        let io_err = |source: std::io::Error| StoreError::Io {
            table: table.to_string(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(rows)
            .map_err(|err| StoreError::Backend(format!("serializing {table}: {err}")))?;

        fs::create_dir_all(&self.root).await.map_err(io_err)?;
        let path = self.table_path(table);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        if let Err(err) = fs::write(&temp_path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(err));
        }
        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(err));
        }
        Ok(())
    }
}

#[async_trait]
impl TableStore for FileTableStore {
    async fn scan_keys(&self, table: &str, _key_attr: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.load(table).await?.into_keys().collect())
    }

    async fn batch_write(
        &self,
        table: &str,
        key_attr: &str,
        ops: Vec<WriteOp>,
    ) -> Result<(), StoreError> {
        let mut rows = self.load(table).await?;
        apply_ops(&mut rows, table, key_attr, ops)?;
        self.save(table, &rows).await
    }

    async fn get_item(
        &self,
        table: &str,
        _key_attr: &str,
        key: &str,
    ) -> Result<Option<Item>, StoreError> {
        Ok(self.load(table).await?.remove(key))
    }
}

/// Buffers item operations and flushes them in groups of at most [`MAX_BATCH_ITEMS`].
pub struct BatchWriter<'a> {
    store: &'a dyn TableStore,
    table: &'a str,
    key_attr: &'a str,
    pending: Vec<WriteOp>,
    round_trips: usize,
    written: usize,
}

impl<'a> BatchWriter<'a> {
    pub fn new(store: &'a dyn TableStore, table: &'a str, key_attr: &'a str) -> Self {
        Self {
            store,
            table,
            key_attr,
            pending: Vec::with_capacity(MAX_BATCH_ITEMS),
            round_trips: 0,
            written: 0,
        }
    }

    pub async fn put(&mut self, item: Item) -> Result<(), StoreError> {
        self.push(WriteOp::Put(item)).await
    }

    pub async fn delete(&mut self, key: impl Into<String>) -> Result<(), StoreError> {
        self.push(WriteOp::Delete(key.into())).await
    }

    async fn push(&mut self, op: WriteOp) -> Result<(), StoreError> {
        self.pending.push(op);
        if self.pending.len() >= MAX_BATCH_ITEMS {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.pending);
        let count = ops.len();
        self.store
            .batch_write(self.table, self.key_attr, ops)
            .instrument(info_span!("batch_write", table = self.table, count))
            .await?;
        self.round_trips += 1;
        self.written += count;
        debug!(table = self.table, count, "flushed batch");
        Ok(())
    }

    /// Flushes the tail and returns `(operations written, round trips)`.
    pub async fn finish(mut self) -> Result<(usize, usize), StoreError> {
        self.flush().await?;
        Ok((self.written, self.round_trips))
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, topic: &str, subject: &str, message: &str)
        -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboxRecord<'a> {
    pub topic: &'a str,
    pub subject: &'a str,
    pub message: &'a str,
    pub published_at: DateTime<Utc>,
}

/// Appends one JSON line per notification to `<root>/<topic>.jsonl`.
#[derive(Debug, Clone)]
pub struct OutboxNotifier {
    root: PathBuf,
}

impl OutboxNotifier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn outbox_path(&self, topic: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", sanitize_file_stem(topic)))
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn publish(
        &self,
        topic: &str,
        subject: &str,
        message: &str,
    ) -> Result<(), NotifyError> {
        let record = OutboxRecord {
            topic,
            subject,
            message,
            published_at: Utc::now(),
        };
        let mut line =
            serde_json::to_vec(&record).map_err(|err| NotifyError::Serialize(err.to_string()))?;
        line.push(b'\n');

        let io_err = |source: std::io::Error| NotifyError::Io {
            topic: topic.to_string(),
            source,
        };
        fs::create_dir_all(&self.root).await.map_err(io_err)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.outbox_path(topic))
            .await
            .map_err(io_err)?;
        file.write_all(&line).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    topic: &'a str,
    subject: &'a str,
    message: &'a str,
}

/// Publishes by POSTing `{topic, subject, message}` as JSON to the topic URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn publish(
        &self,
        topic: &str,
        subject: &str,
        message: &str,
    ) -> Result<(), NotifyError> {
        let http_err = |reason: String| NotifyError::Http {
            topic: topic.to_string(),
            reason,
        };
        let resp = self
            .client
            .post(topic)
            .json(&WebhookPayload {
                topic,
                subject,
                message,
            })
            .send()
            .await
            .map_err(|err| http_err(err.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(http_err(format!("http status {}", status.as_u16())));
        }
        Ok(())
    }
}

pub fn is_webhook_topic(topic: &str) -> bool {
    topic.starts_with("http://") || topic.starts_with("https://")
}

/// URL topics publish over HTTP; anything else (e.g. a topic ARN) lands in the local outbox.
pub fn notifier_for_topic(
    topic: &str,
    outbox_root: impl Into<PathBuf>,
    http: HttpClientConfig,
) -> anyhow::Result<Box<dyn Notifier>> {
    if is_webhook_topic(topic) {
        Ok(Box::new(WebhookNotifier::new(http)?))
    } else {
        Ok(Box::new(OutboxNotifier::new(outbox_root)))
    }
}

/// Maps a table or topic name to a file stem. Names that needed rewriting get a hash suffix
/// so distinct names never share a file.
fn sanitize_file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = match stem.trim_start_matches('.') {
        "" => "_",
        trimmed => trimmed,
    };
    if stem == name {
        stem.to_string()
    } else {
        format!("{stem}-{}", &sha256_hex(name.as_bytes())[..8])
    }
}
