//! Records: the reactive wrapper for one entity instance.
//!
//! A [`Record`] tracks the last server-confirmed value and the locally
//! drafted value side by side. UI code edits the draft through
//! [`Record::update`] and persists it with [`Record::commit`]; the
//! scheduler writes server confirmations back through the crate-internal
//! surface. Every observable change bumps `version` and notifies watchers.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::WriteError;
use crate::scheduler::{DispatchMode, MutationScheduler, PayloadBuilder};
use crate::{EntityKind, RecordId, Version};

/// Prefix of client-generated ids the server has not confirmed yet.
pub const TEMP_ID_PREFIX: &str = "new-";

/// Whether an id is a client-generated temporary id.
pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Options for [`Record::update`].
#[derive(Debug, Clone, Copy)]
pub struct UpdateOptions {
    /// When true (the default) the edit always marks the record dirty.
    /// When false the edit is a fix-up that only dirties the record if the
    /// resulting draft actually diverges from the server value.
    pub mutate: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self { mutate: true }
    }
}

impl UpdateOptions {
    /// A non-mutating fix-up edit.
    pub fn fixup() -> Self {
        Self { mutate: false }
    }
}

/// Cheap snapshot of a record's synchronization state, for pending-state
/// affordances in the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordStatus {
    pub version: Version,
    pub dirty: bool,
    pub in_flight: bool,
    pub invalidated: bool,
    pub last_error: Option<WriteError>,
}

/// The mutable state behind a record handle.
#[derive(Debug, Clone)]
struct RecordState {
    server_value: Value,
    draft: Value,
    dirty: bool,
    version: Version,
    in_flight: bool,
    invalidated: bool,
    last_error: Option<WriteError>,
}

impl RecordState {
    fn new(value: Value) -> Self {
        Self {
            server_value: value.clone(),
            draft: value,
            dirty: false,
            version: 1,
            in_flight: false,
            invalidated: false,
            last_error: None,
        }
    }

    fn bump(&mut self) {
        self.version += 1;
    }

    fn install_draft(&mut self, next: Value, mutate: bool) {
        self.dirty = mutate || next != self.server_value;
        self.draft = next;
        self.bump();
    }

    fn apply_server_update(&mut self, value: Value) {
        self.server_value = value;
        if !self.dirty {
            self.draft = self.server_value.clone();
        }
        self.invalidated = false;
        self.bump();
    }

    /// Install a successful write result. `sent` is the draft the payload
    /// was built from; if the draft has not moved since dispatch the record
    /// becomes clean, otherwise dirtiness is recomputed against the new
    /// server value.
    fn confirm_write(&mut self, sent: &Value, value: Value) {
        self.server_value = value;
        if self.draft == *sent {
            self.draft = self.server_value.clone();
            self.dirty = false;
        } else {
            self.dirty = self.draft != self.server_value;
        }
        self.last_error = None;
        self.bump();
    }

    fn rollback(&mut self) {
        self.draft = self.server_value.clone();
        self.dirty = false;
        self.last_error = None;
        self.bump();
    }

    fn status(&self) -> RecordStatus {
        RecordStatus {
            version: self.version,
            dirty: self.dirty,
            in_flight: self.in_flight,
            invalidated: self.invalidated,
            last_error: self.last_error.clone(),
        }
    }
}

/// Registry of version watchers for one record.
///
/// Watchers that dropped their receiver are pruned on the next notify.
#[derive(Debug, Default)]
struct WatcherSet {
    senders: DashMap<String, mpsc::UnboundedSender<Version>>,
}

impl WatcherSet {
    fn notify(&self, version: Version) {
        self.senders.retain(|_, tx| tx.send(version).is_ok());
    }
}

/// Listener half of a record subscription.
///
/// Dropping the watcher unsubscribes it.
pub struct RecordWatcher {
    id: String,
    set: Weak<WatcherSet>,
    rx: mpsc::UnboundedReceiver<Version>,
}

impl RecordWatcher {
    /// Wait for the next version change. Returns `None` once the record is
    /// gone and no notifications remain.
    pub async fn changed(&mut self) -> Option<Version> {
        self.rx.recv().await
    }

    /// Drain buffered notifications without waiting, returning the most
    /// recent version seen, if any.
    pub fn latest(&mut self) -> Option<Version> {
        let mut last = None;
        while let Ok(version) = self.rx.try_recv() {
            last = Some(version);
        }
        last
    }
}

impl Drop for RecordWatcher {
    fn drop(&mut self) {
        if let Some(set) = self.set.upgrade() {
            set.senders.remove(&self.id);
        }
    }
}

struct RecordInner {
    kind: EntityKind,
    id: RwLock<RecordId>,
    state: RwLock<RecordState>,
    watchers: Arc<WatcherSet>,
    scheduler: MutationScheduler,
}

/// Shared handle to one entity's cached state.
///
/// Handles are cheap to clone and safe to hold across the UI tree; all
/// mutation goes through the methods here so version bumps and dirty
/// tracking stay correct.
#[derive(Clone)]
pub struct Record {
    inner: Arc<RecordInner>,
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Record")
            .field("kind", &self.inner.kind)
            .field("id", &self.id())
            .field("version", &state.version)
            .field("dirty", &state.dirty)
            .field("in_flight", &state.in_flight)
            .finish()
    }
}

impl Record {
    pub(crate) fn new(
        kind: EntityKind,
        id: RecordId,
        value: Value,
        scheduler: MutationScheduler,
    ) -> Self {
        Self {
            inner: Arc::new(RecordInner {
                kind,
                id: RwLock::new(id),
                state: RwLock::new(RecordState::new(value)),
                watchers: Arc::new(WatcherSet::default()),
                scheduler,
            }),
        }
    }

    fn state(&self) -> RwLockReadGuard<'_, RecordState> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, RecordState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, version: Version) {
        self.inner.watchers.notify(version);
    }

    /// The entity kind this record belongs to.
    pub fn kind(&self) -> &EntityKind {
        &self.inner.kind
    }

    /// The record's current id. Temporary until the server confirms a
    /// created record, permanent afterwards.
    pub fn id(&self) -> RecordId {
        self.inner
            .id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether this record still carries a client-generated id.
    pub fn is_temporary(&self) -> bool {
        is_temporary_id(&self.id())
    }

    /// The current draft value. No side effects.
    pub fn read(&self) -> Value {
        self.state().draft.clone()
    }

    /// The last server-confirmed value.
    pub fn server_value(&self) -> Value {
        self.state().server_value.clone()
    }

    /// The current version counter.
    pub fn version(&self) -> Version {
        self.state().version
    }

    /// Snapshot of the record's synchronization state.
    pub fn status(&self) -> RecordStatus {
        self.state().status()
    }

    /// Apply a mutator to the draft.
    ///
    /// The mutator runs on a copy outside any lock, so a panicking mutator
    /// leaves the record unchanged and the panic propagates to the caller.
    pub fn update(&self, options: UpdateOptions, mutator: impl FnOnce(&mut Value)) {
        let mut next = self.read();
        mutator(&mut next);
        let version = {
            let mut state = self.state_mut();
            state.install_draft(next, options.mutate);
            state.version
        };
        self.notify(version);
    }

    /// Enqueue the dirty draft for immediate persistence.
    ///
    /// No-op when the record is neither dirty nor newly created. Returns
    /// right away; the write itself is driven by the scheduler. Must be
    /// called from within a tokio runtime.
    pub fn commit(&self) {
        self.commit_with(DispatchMode::Immediate, |draft: &Value| draft.clone());
    }

    /// Like [`Record::commit`], but coalesced over the configured quiet
    /// window. Use for free-text fields; pair with [`Record::flush`] on
    /// blur or unmount.
    pub fn commit_debounced(&self) {
        self.commit_with(DispatchMode::Debounced, |draft: &Value| draft.clone());
    }

    /// Commit with an explicit dispatch mode and payload builder. The
    /// builder maps the draft at dispatch time to the wire payload,
    /// allowing partial (per-field) mutations.
    pub fn commit_with(
        &self,
        mode: DispatchMode,
        builder: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) {
        let status = self.status();
        if !status.dirty && !self.is_temporary() {
            return;
        }
        let builder: PayloadBuilder = Arc::new(builder);
        self.inner.scheduler.enqueue(self.clone(), mode, builder);
    }

    /// Force a queued debounced commit to dispatch now.
    pub fn flush(&self) {
        self.inner.scheduler.flush(&self.inner.kind, &self.id());
    }

    /// Discard the draft: restore it to the server value, clear dirtiness
    /// and any surfaced error, and cancel a queued (not in-flight) write.
    pub fn rollback(&self) {
        self.inner.scheduler.cancel(&self.inner.kind, &self.id());
        let version = {
            let mut state = self.state_mut();
            state.rollback();
            state.version
        };
        self.notify(version);
    }

    /// Install a fresh server value (out-of-band refresh or hydration).
    /// Keeps a dirty draft in place; clean records track the server.
    pub fn apply_server_update(&self, value: Value) {
        let version = {
            let mut state = self.state_mut();
            state.apply_server_update(value);
            state.version
        };
        self.notify(version);
    }

    /// Mark the record stale and kick off a background refresh through the
    /// remote source. The draft stays visible until the refresh lands, so
    /// the UI never flickers to empty.
    pub fn invalidate(&self) {
        let version = {
            let mut state = self.state_mut();
            state.invalidated = true;
            state.bump();
            state.version
        };
        self.notify(version);
        self.inner
            .scheduler
            .spawn_refresh(self.inner.kind.clone(), self.id());
    }

    /// Subscribe to version changes.
    pub fn subscribe(&self) -> RecordWatcher {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4().to_string();
        self.inner.watchers.senders.insert(id.clone(), tx);
        RecordWatcher {
            id,
            set: Arc::downgrade(&self.inner.watchers),
            rx,
        }
    }

    pub(crate) fn confirm_write(&self, sent: &Value, value: Value) {
        let version = {
            let mut state = self.state_mut();
            state.confirm_write(sent, value);
            state.version
        };
        self.notify(version);
    }

    pub(crate) fn set_in_flight(&self, in_flight: bool) {
        let version = {
            let mut state = self.state_mut();
            state.in_flight = in_flight;
            state.bump();
            state.version
        };
        self.notify(version);
    }

    pub(crate) fn set_error(&self, error: WriteError) {
        let version = {
            let mut state = self.state_mut();
            state.last_error = Some(error);
            state.bump();
            state.version
        };
        self.notify(version);
    }

    /// Apply a server-confirmed derived patch (relationship maintenance).
    /// Touches both the server value and the draft so the record's
    /// dirtiness is unaffected.
    pub(crate) fn apply_derived_patch(&self, patch: impl Fn(&mut Value)) {
        let version = {
            let mut state = self.state_mut();
            patch(&mut state.server_value);
            patch(&mut state.draft);
            state.bump();
            state.version
        };
        self.notify(version);
    }

    pub(crate) fn set_id(&self, id: RecordId) {
        {
            let mut guard = self.inner.id.write().unwrap_or_else(PoisonError::into_inner);
            *guard = id;
        }
        let version = {
            let mut state = self.state_mut();
            state.bump();
            state.version
        };
        self.notify(version);
    }
}
