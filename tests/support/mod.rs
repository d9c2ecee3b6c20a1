//! Shared test support: a scripted remote data source.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tether_store::{FetchError, PageQuery, Record, RemoteDataSource, WriteError};

type Responder = Box<dyn FnMut(&str, &str, &Value) -> Result<Value, WriteError> + Send>;

/// A remote source driven entirely by the test: every write is logged, the
/// outcome comes from a configurable responder (default: echo the payload),
/// and overlapping writes for the same record trip the `overlap` flag.
pub struct ScriptedSource {
    writes: Mutex<Vec<(String, String, Value)>>,
    responder: Mutex<Responder>,
    active: Mutex<HashSet<(String, String)>>,
    pub overlap: AtomicBool,
    latency: Duration,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Self::with_latency(Duration::from_millis(20))
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            writes: Mutex::new(Vec::new()),
            responder: Mutex::new(Box::new(|_, _, payload| Ok(payload.clone()))),
            active: Mutex::new(HashSet::new()),
            overlap: AtomicBool::new(false),
            latency,
        })
    }

    pub fn set_responder(
        &self,
        responder: impl FnMut(&str, &str, &Value) -> Result<Value, WriteError> + Send + 'static,
    ) {
        *self
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Box::new(responder);
    }

    pub fn writes(&self) -> Vec<(String, String, Value)> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn writes_for(&self, id: &str) -> Vec<Value> {
        self.writes()
            .into_iter()
            .filter(|(_, write_id, _)| write_id == id)
            .map(|(_, _, payload)| payload)
            .collect()
    }

    pub fn saw_overlap(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteDataSource for ScriptedSource {
    async fn fetch_page(&self, _kind: &str, _query: PageQuery) -> Result<Vec<Value>, FetchError> {
        Ok(Vec::new())
    }

    async fn write(&self, kind: &str, id: &str, payload: Value) -> Result<Value, WriteError> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind.to_string(), id.to_string(), payload.clone()));

        let key = (kind.to_string(), id.to_string());
        {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if !active.insert(key.clone()) {
                self.overlap.store(true, Ordering::SeqCst);
            }
        }

        tokio::time::sleep(self.latency).await;

        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);

        let mut responder = self
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        responder(kind, id, &payload)
    }
}

/// Wait until the record has no pending or in-flight work. Tests run on
/// paused virtual time, so this loop is deterministic.
pub async fn settle(record: &Record) {
    for _ in 0..1000 {
        let status = record.status();
        if !status.in_flight && (!status.dirty || status.last_error.is_some()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("record never settled: {:?}", record.status());
}
