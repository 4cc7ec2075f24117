//! Storage abstraction (§6 external interfaces).
//!
//! The core never reaches for a database directly — every durable write
//! goes through [`Store`], exactly the pattern the in-memory mock storage in
//! the original system stood in for. Two implementations are provided: the
//! fast, test-friendly [`InMemoryStore`], and [`JsonlStore`], an append-only
//! file-backed implementation grounded on the JSONL sink's
//! open-append-flush discipline.

use crate::error::Error;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Snapshot of a registered service instance, as persisted by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub id: String,
    pub name: String,
    pub version: String,
    pub endpoints: Vec<String>,
    pub weight: f64,
    pub metadata: serde_json::Value,
    pub tags: Vec<String>,
}

/// One entry in an append-only event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub position: u64,
    pub stream_name: String,
    pub event_type: String,
    pub aggregate_id: String,
    pub version: u64,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
    pub produced_at_millis: u64,
}

/// A message handed to the storage interface for durable queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableMessage {
    pub id: String,
    pub queue: String,
    pub content: serde_json::Value,
    pub headers: serde_json::Value,
    pub priority: u8,
}

/// Abstract storage contract every durable path writes through before
/// acknowledging its caller. Implementations need not be transactional
/// across methods; callers that need atomicity compose multiple calls
/// under their own lock.
#[async_trait]
pub trait Store: Send + Sync {
    async fn put_service(&self, record: ServiceSnapshot) -> Result<(), Error>;
    async fn delete_service(&self, id: &str) -> Result<(), Error>;
    async fn list_services(&self) -> Result<Vec<ServiceSnapshot>, Error>;

    /// Appends one event to `stream_name`, returning its assigned position.
    /// Position is monotonically increasing per stream, starting at 1.
    async fn append_event(
        &self,
        stream_name: &str,
        event_type: &str,
        aggregate_id: &str,
        payload: serde_json::Value,
        metadata: serde_json::Value,
        produced_at_millis: u64,
    ) -> Result<u64, Error>;

    async fn load_stream(
        &self,
        stream_name: &str,
        from_position: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, Error>;

    async fn put_queue_meta(&self, queue: &str, meta: serde_json::Value) -> Result<(), Error>;
    async fn put_message(&self, message: DurableMessage) -> Result<(), Error>;
    async fn delete_message(&self, id: &str) -> Result<(), Error>;
    async fn put_breaker_state(&self, name: &str, state: serde_json::Value) -> Result<(), Error>;
    async fn put_metrics_point(&self, point: serde_json::Value) -> Result<(), Error>;
}

#[derive(Default)]
struct StreamLog {
    events: Vec<EventRecord>,
}

/// In-memory [`Store`]: `DashMap`-keyed, no persistence across process
/// restarts. The default choice for tests and for deployments that accept
/// losing durable state on crash in exchange for zero I/O.
#[derive(Default)]
pub struct InMemoryStore {
    services: DashMap<String, ServiceSnapshot>,
    streams: DashMap<String, StreamLog>,
    queue_meta: DashMap<String, serde_json::Value>,
    messages: DashMap<String, DurableMessage>,
    breaker_state: DashMap<String, serde_json::Value>,
    metrics: DashMap<u64, serde_json::Value>,
    metrics_seq: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put_service(&self, record: ServiceSnapshot) -> Result<(), Error> {
        self.services.insert(record.id.clone(), record);
        Ok(())
    }

    async fn delete_service(&self, id: &str) -> Result<(), Error> {
        self.services.remove(id);
        Ok(())
    }

    async fn list_services(&self) -> Result<Vec<ServiceSnapshot>, Error> {
        Ok(self.services.iter().map(|e| e.value().clone()).collect())
    }

    async fn append_event(
        &self,
        stream_name: &str,
        event_type: &str,
        aggregate_id: &str,
        payload: serde_json::Value,
        metadata: serde_json::Value,
        produced_at_millis: u64,
    ) -> Result<u64, Error> {
        let mut log = self.streams.entry(stream_name.to_string()).or_default();
        let position = log.events.len() as u64 + 1;
        log.events.push(EventRecord {
            position,
            stream_name: stream_name.to_string(),
            event_type: event_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            version: position,
            payload,
            metadata,
            produced_at_millis,
        });
        Ok(position)
    }

    async fn load_stream(
        &self,
        stream_name: &str,
        from_position: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, Error> {
        let Some(log) = self.streams.get(stream_name) else {
            return Ok(Vec::new());
        };
        Ok(log
            .events
            .iter()
            .filter(|e| e.position >= from_position)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn put_queue_meta(&self, queue: &str, meta: serde_json::Value) -> Result<(), Error> {
        self.queue_meta.insert(queue.to_string(), meta);
        Ok(())
    }

    async fn put_message(&self, message: DurableMessage) -> Result<(), Error> {
        self.messages.insert(message.id.clone(), message);
        Ok(())
    }

    async fn delete_message(&self, id: &str) -> Result<(), Error> {
        self.messages.remove(id);
        Ok(())
    }

    async fn put_breaker_state(&self, name: &str, state: serde_json::Value) -> Result<(), Error> {
        self.breaker_state.insert(name.to_string(), state);
        Ok(())
    }

    async fn put_metrics_point(&self, point: serde_json::Value) -> Result<(), Error> {
        let seq = self.metrics_seq.fetch_add(1, Ordering::SeqCst);
        self.metrics.insert(seq, point);
        Ok(())
    }
}

/// Append-only JSONL-file-backed [`Store`]. Every call appends one line
/// tagged with a record kind; an in-memory cache (rebuilt by replaying the
/// file in [`JsonlStore::open`]) serves reads, mirroring how the original
/// system's mock storage kept everything in memory but this implementation
/// also durably journals every write.
pub struct JsonlStore {
    path: String,
    file_lock: tokio::sync::Mutex<()>,
    cache: InMemoryStore,
    stream_positions: DashMap<String, Arc<AtomicU64>>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "record")]
enum JournalLine {
    Service { record: ServiceSnapshot },
    ServiceDeleted { id: String },
    Event {
        stream_name: String,
        event_type: String,
        aggregate_id: String,
        payload: serde_json::Value,
        metadata: serde_json::Value,
        produced_at_millis: u64,
    },
    QueueMeta { queue: String, meta: serde_json::Value },
    Message { message: DurableMessage },
    MessageDeleted { id: String },
    BreakerState { name: String, state: serde_json::Value },
    MetricsPoint { point: serde_json::Value },
}

impl JsonlStore {
    /// Opens (creating if absent) the journal at `path` and replays any
    /// existing lines to rebuild the in-memory read cache.
    pub async fn open(path: impl Into<String>) -> std::io::Result<Self> {
        use tokio::io::AsyncBufReadExt;

        let path = path.into();
        let store = Self {
            path: path.clone(),
            file_lock: tokio::sync::Mutex::new(()),
            cache: InMemoryStore::new(),
            stream_positions: DashMap::new(),
        };

        if let Ok(file) = tokio::fs::File::open(&path).await {
            let mut lines = tokio::io::BufReader::new(file).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                if let Ok(entry) = serde_json::from_str::<JournalLine>(&line) {
                    store.replay(entry).await;
                }
            }
        }

        Ok(store)
    }

    async fn replay(&self, entry: JournalLine) {
        match entry {
            JournalLine::Service { record } => {
                let _ = self.cache.put_service(record).await;
            }
            JournalLine::ServiceDeleted { id } => {
                let _ = self.cache.delete_service(&id).await;
            }
            JournalLine::Event {
                stream_name,
                event_type,
                aggregate_id,
                payload,
                metadata,
                produced_at_millis,
            } => {
                let _ = self
                    .cache
                    .append_event(&stream_name, &event_type, &aggregate_id, payload, metadata, produced_at_millis)
                    .await;
            }
            JournalLine::QueueMeta { queue, meta } => {
                let _ = self.cache.put_queue_meta(&queue, meta).await;
            }
            JournalLine::Message { message } => {
                let _ = self.cache.put_message(message).await;
            }
            JournalLine::MessageDeleted { id } => {
                let _ = self.cache.delete_message(&id).await;
            }
            JournalLine::BreakerState { name, state } => {
                let _ = self.cache.put_breaker_state(&name, state).await;
            }
            JournalLine::MetricsPoint { point } => {
                let _ = self.cache.put_metrics_point(point).await;
            }
        }
    }

    async fn append_line(&self, entry: &JournalLine) -> Result<(), Error> {
        use tokio::io::AsyncWriteExt;

        let line = serde_json::to_string(entry)
            .map_err(|e| Error::with_source(crate::error::ErrorKind::Internal, "failed to serialize journal line", e))?
            + "\n";

        let _guard = self.file_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::with_source(crate::error::ErrorKind::Internal, "failed to open journal file", e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::with_source(crate::error::ErrorKind::Internal, "failed to write journal line", e))?;
        file.flush()
            .await
            .map_err(|e| Error::with_source(crate::error::ErrorKind::Internal, "failed to flush journal file", e))?;
        Ok(())
    }
}

#[async_trait]
impl Store for JsonlStore {
    async fn put_service(&self, record: ServiceSnapshot) -> Result<(), Error> {
        self.append_line(&JournalLine::Service { record: record.clone() }).await?;
        self.cache.put_service(record).await
    }

    async fn delete_service(&self, id: &str) -> Result<(), Error> {
        self.append_line(&JournalLine::ServiceDeleted { id: id.to_string() }).await?;
        self.cache.delete_service(id).await
    }

    async fn list_services(&self) -> Result<Vec<ServiceSnapshot>, Error> {
        self.cache.list_services().await
    }

    async fn append_event(
        &self,
        stream_name: &str,
        event_type: &str,
        aggregate_id: &str,
        payload: serde_json::Value,
        metadata: serde_json::Value,
        produced_at_millis: u64,
    ) -> Result<u64, Error> {
        self.append_line(&JournalLine::Event {
            stream_name: stream_name.to_string(),
            event_type: event_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            payload: payload.clone(),
            metadata: metadata.clone(),
            produced_at_millis,
        })
        .await?;
        self.cache
            .append_event(stream_name, event_type, aggregate_id, payload, metadata, produced_at_millis)
            .await
    }

    async fn load_stream(
        &self,
        stream_name: &str,
        from_position: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, Error> {
        self.cache.load_stream(stream_name, from_position, limit).await
    }

    async fn put_queue_meta(&self, queue: &str, meta: serde_json::Value) -> Result<(), Error> {
        self.append_line(&JournalLine::QueueMeta { queue: queue.to_string(), meta: meta.clone() }).await?;
        self.cache.put_queue_meta(queue, meta).await
    }

    async fn put_message(&self, message: DurableMessage) -> Result<(), Error> {
        self.append_line(&JournalLine::Message { message: message.clone() }).await?;
        self.cache.put_message(message).await
    }

    async fn delete_message(&self, id: &str) -> Result<(), Error> {
        self.append_line(&JournalLine::MessageDeleted { id: id.to_string() }).await?;
        self.cache.delete_message(id).await
    }

    async fn put_breaker_state(&self, name: &str, state: serde_json::Value) -> Result<(), Error> {
        self.append_line(&JournalLine::BreakerState { name: name.to_string(), state: state.clone() }).await?;
        self.cache.put_breaker_state(name, state).await
    }

    async fn put_metrics_point(&self, point: serde_json::Value) -> Result<(), Error> {
        self.append_line(&JournalLine::MetricsPoint { point: point.clone() }).await?;
        self.cache.put_metrics_point(point).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(id: &str) -> ServiceSnapshot {
        ServiceSnapshot {
            id: id.to_string(),
            name: "payments".into(),
            version: "1.0.0".into(),
            endpoints: vec!["10.0.0.1:8080".into()],
            weight: 1.0,
            metadata: serde_json::json!({}),
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn in_memory_store_roundtrips_services() {
        let store = InMemoryStore::new();
        store.put_service(svc("a")).await.unwrap();
        store.put_service(svc("b")).await.unwrap();
        assert_eq!(store.list_services().await.unwrap().len(), 2);
        store.delete_service("a").await.unwrap();
        assert_eq!(store.list_services().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn in_memory_store_event_stream_positions_are_monotonic() {
        let store = InMemoryStore::new();
        let p1 = store
            .append_event("orders", "Created", "order-1", serde_json::json!({}), serde_json::json!({}), 1)
            .await
            .unwrap();
        let p2 = store
            .append_event("orders", "Shipped", "order-1", serde_json::json!({}), serde_json::json!({}), 2)
            .await
            .unwrap();
        assert_eq!(p1, 1);
        assert_eq!(p2, 2);

        let events = store.load_stream("orders", 2, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "Shipped");
    }

    #[tokio::test]
    async fn jsonl_store_persists_and_replays_across_reopen() {
        let dir = std::env::temp_dir().join(format!("meshline-store-test-{}", uuid::Uuid::new_v4()));
        let path = dir.to_string_lossy().to_string();

        {
            let store = JsonlStore::open(&path).await.unwrap();
            store.put_service(svc("a")).await.unwrap();
            store
                .append_event("orders", "Created", "order-1", serde_json::json!({"total": 10}), serde_json::json!({}), 5)
                .await
                .unwrap();
        }

        let reopened = JsonlStore::open(&path).await.unwrap();
        let services = reopened.list_services().await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].id, "a");

        let events = reopened.load_stream("orders", 1, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["total"], 10);

        let _ = tokio::fs::remove_file(&path).await;
    }
}
