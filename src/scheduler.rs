//! The mutation scheduler: batched, ordered persistence of dirty drafts.
//!
//! Every record with pending work gets one worker task. The worker owns the
//! record's write pipeline end to end: it debounces free-text edits over a
//! quiet window, coalesces queued edits so only the newest unsent payload
//! survives, dispatches at most one write at a time, retries transient
//! failures with backoff, and surfaces terminal failures into the record's
//! state instead of throwing into UI paths.
//!
//! Writes for the same record are strictly FIFO; writes for different
//! records are independent.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::{sleep, sleep_until, Instant};

use crate::config::StoreConfig;
use crate::record::{is_temporary_id, Record};
use crate::relationship::RelationshipIndex;
use crate::source::{PageQuery, RemoteDataSource};
use crate::store::RegistryMap;
use crate::{EntityKind, RecordId};

/// How an enqueued write reaches the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Dispatch as soon as the worker picks the entry up. For structural
    /// edits: toggles, selections, link changes.
    Immediate,
    /// Wait for a quiet window before dispatching. For free-text fields;
    /// every further enqueue restarts the window.
    Debounced,
}

/// Pure function from the draft at dispatch time to the wire payload.
pub type PayloadBuilder = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

type WorkerKey = (EntityKind, RecordId);

/// One coalesced pending write for a record.
struct QueueEntry {
    builder: PayloadBuilder,
    retry_count: u32,
    #[allow(dead_code)]
    created_at: Instant,
}

struct SlotState {
    queued: Option<QueueEntry>,
    /// Earliest moment the queued entry may dispatch.
    deadline: Instant,
    flush: bool,
}

/// Per-record coordination point between enqueuers and the worker task.
struct WorkerSlot {
    state: Mutex<SlotState>,
    notify: Notify,
}

impl WorkerSlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct SchedulerInner {
    source: Arc<dyn RemoteDataSource>,
    config: StoreConfig,
    relationships: RelationshipIndex,
    registry: OnceLock<Weak<RegistryMap>>,
    workers: DashMap<WorkerKey, Arc<WorkerSlot>>,
}

/// Shared handle to the write scheduler.
///
/// Normal entry points are [`Record::commit`], [`Record::commit_debounced`]
/// and [`Record::flush`]; the scheduler itself is wired up by
/// [`crate::Store::new`].
#[derive(Clone)]
pub struct MutationScheduler {
    inner: Arc<SchedulerInner>,
}

impl fmt::Debug for MutationScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationScheduler")
            .field("active_workers", &self.inner.workers.len())
            .finish()
    }
}

impl MutationScheduler {
    pub(crate) fn new(
        source: Arc<dyn RemoteDataSource>,
        config: StoreConfig,
        relationships: RelationshipIndex,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                source,
                config,
                relationships,
                registry: OnceLock::new(),
                workers: DashMap::new(),
            }),
        }
    }

    /// Wire the collection registry in after store construction. The
    /// scheduler only holds it weakly so workers outlive nothing.
    pub(crate) fn attach(&self, registry: &Arc<RegistryMap>) {
        let _ = self.inner.registry.set(Arc::downgrade(registry));
    }

    fn registry(&self) -> Option<Arc<RegistryMap>> {
        self.inner.registry.get()?.upgrade()
    }

    /// Queue a write for the record, coalescing with any queued-but-unsent
    /// entry. If a write is already in flight the entry runs after it
    /// resolves; two writes for one record never overlap.
    pub(crate) fn enqueue(&self, record: Record, mode: DispatchMode, builder: PayloadBuilder) {
        let key = (record.kind().clone(), record.id());
        let now = Instant::now();
        let deadline = match mode {
            DispatchMode::Immediate => now,
            DispatchMode::Debounced => now + self.inner.config.debounce_interval,
        };
        let entry = QueueEntry {
            builder,
            retry_count: 0,
            created_at: now,
        };

        match self.inner.workers.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                let slot = occupied.get();
                let mut state = slot.lock();
                state.queued = Some(entry);
                state.deadline = deadline;
                state.flush = false;
                slot.notify.notify_one();
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let slot = Arc::new(WorkerSlot {
                    state: Mutex::new(SlotState {
                        queued: Some(entry),
                        deadline,
                        flush: false,
                    }),
                    notify: Notify::new(),
                });
                vacant.insert(slot.clone());
                let scheduler = self.clone();
                tokio::spawn(run_worker(scheduler, record, slot, key));
            }
        }
    }

    /// Force a queued (not in-flight) entry to dispatch now, bypassing the
    /// remaining debounce delay. Used for blur/unmount edge cases.
    pub fn flush(&self, kind: &str, id: &str) {
        if let Some(slot) = self.inner.workers.get(&(kind.to_string(), id.to_string())) {
            let mut state = slot.lock();
            if state.queued.is_some() {
                state.flush = true;
                slot.notify.notify_one();
            }
        }
    }

    /// Drop a queued (not in-flight) entry. An in-flight write is allowed
    /// to complete and its result is applied.
    pub fn cancel(&self, kind: &str, id: &str) {
        if let Some(slot) = self.inner.workers.get(&(kind.to_string(), id.to_string())) {
            let mut state = slot.lock();
            state.queued = None;
            slot.notify.notify_one();
        }
    }

    /// Sever every declared relationship referencing a removed record.
    pub(crate) fn sever(&self, kind: &str, id: &str) {
        if let Some(registry) = self.registry() {
            self.inner.relationships.sever(&registry, kind, id);
        }
    }

    /// Re-fetch a single record in the background and hydrate the result.
    pub(crate) fn spawn_refresh(&self, kind: EntityKind, id: RecordId) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let Some(registry) = scheduler.registry() else {
                return;
            };
            let Some(collection) = registry.get(&kind) else {
                return;
            };
            let query = PageQuery::by_id(id.clone());
            match scheduler.inner.source.fetch_page(&kind, query).await {
                Ok(page) => {
                    collection.hydrate(page);
                }
                Err(err) => {
                    tracing::warn!(kind = %kind, id = %id, error = %err, "background refresh failed");
                }
            }
        });
    }

    fn server_id_of(&self, kind: &str, value: &Value) -> Option<RecordId> {
        let registry = self.registry()?;
        registry.get(kind)?.id_of(value)
    }

    /// The server confirmed a created record under a new id: move the
    /// record in its collection, rewrite every relationship referencing
    /// the temporary id, and re-key the worker slot, all in one pass.
    fn confirm_created(&self, record: &Record, key: &mut WorkerKey, temp_id: &str, real_id: &str) {
        let kind = record.kind().clone();
        tracing::info!(kind = %kind, temp_id = %temp_id, id = %real_id, "temporary id confirmed");

        if let Some(registry) = self.registry() {
            let rekeyed = registry
                .get(&kind)
                .map(|collection| collection.rekey(temp_id, real_id))
                .unwrap_or(false);
            if !rekeyed {
                record.set_id(real_id.to_string());
            }
            self.inner
                .relationships
                .rewrite_temporary_id(&registry, &kind, temp_id, real_id);
        } else {
            record.set_id(real_id.to_string());
        }

        if let Some((_, slot)) = self.inner.workers.remove(key) {
            let new_key = (kind, real_id.to_string());
            self.inner.workers.insert(new_key.clone(), slot);
            *key = new_key;
        }
    }
}

/// Retire the worker if nothing is queued. Returns true when the slot was
/// removed and the task should exit; false when new work raced in.
fn try_retire(scheduler: &MutationScheduler, key: &WorkerKey, slot: &Arc<WorkerSlot>) -> bool {
    scheduler
        .inner
        .workers
        .remove_if(key, |_, current| {
            Arc::ptr_eq(current, slot) && current.lock().queued.is_none()
        })
        .is_some()
}

async fn run_worker(
    scheduler: MutationScheduler,
    record: Record,
    slot: Arc<WorkerSlot>,
    mut key: WorkerKey,
) {
    loop {
        // Debounce: wait until the entry's deadline passes, a flush
        // arrives, or the entry is cancelled.
        loop {
            let (deadline, ready) = {
                let state = slot.lock();
                match state.queued {
                    None => (Instant::now(), true),
                    Some(_) => (state.deadline, state.flush),
                }
            };
            if ready || Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = slot.notify.notified() => {}
            }
        }

        let taken = {
            let mut state = slot.lock();
            state.flush = false;
            state.queued.take()
        };

        match taken {
            Some(mut entry) => {
                dispatch(&scheduler, &record, &mut key, &mut entry).await;
            }
            None => {
                // Cancelled before dispatch.
                if try_retire(&scheduler, &key, &slot) {
                    return;
                }
                continue;
            }
        }

        // Work queued while the write was in flight runs next, in order.
        let has_next = slot.lock().queued.is_some();
        if !has_next && try_retire(&scheduler, &key, &slot) {
            return;
        }
    }
}

async fn dispatch(
    scheduler: &MutationScheduler,
    record: &Record,
    key: &mut WorkerKey,
    entry: &mut QueueEntry,
) {
    let inner = &scheduler.inner;
    let kind = record.kind().clone();
    let id = record.id();
    let sent = record.read();
    let payload = (entry.builder)(&sent);
    let before = record.server_value();

    record.set_in_flight(true);

    let outcome = loop {
        match inner.source.write(&kind, &id, payload.clone()).await {
            Ok(value) => break Ok(value),
            Err(err) if err.is_transient() => {
                entry.retry_count += 1;
                if entry.retry_count >= inner.config.max_write_attempts {
                    break Err(err);
                }
                let backoff = inner.config.retry_backoff * 2u32.pow(entry.retry_count - 1);
                tracing::debug!(
                    kind = %kind,
                    id = %id,
                    attempt = entry.retry_count,
                    backoff_ms = backoff.as_millis() as u64,
                    "transient write failure, backing off"
                );
                sleep(backoff).await;
            }
            Err(err) => break Err(err),
        }
    };

    match outcome {
        Ok(value) => {
            record.confirm_write(&sent, value.clone());

            if is_temporary_id(&id) {
                if let Some(real_id) = scheduler.server_id_of(&kind, &value) {
                    if real_id != id {
                        scheduler.confirm_created(record, key, &id, &real_id);
                    }
                }
            }

            // Patch both sides of every touched relationship before the
            // worker yields, so reads after the commit resolve see a
            // consistent graph.
            let after = record.server_value();
            if let Some(registry) = scheduler.registry() {
                inner
                    .relationships
                    .on_commit_success(&registry, &kind, &record.id(), &before, &after);
            }

            record.set_in_flight(false);
            tracing::debug!(kind = %kind, id = %record.id(), "write confirmed");
        }
        Err(err) => {
            tracing::warn!(kind = %kind, id = %id, error = %err, "write failed, keeping dirty draft");
            record.set_in_flight(false);
            record.set_error(err);
        }
    }
}
