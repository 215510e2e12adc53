//! Session tying the registry, offline queue, transport and object graph
//! together.

use crate::error::{Result, SubscriptionError, SyncError};
use crate::query::{canonicalize, Fingerprint, QuerySpec};
use crate::queue::{Intent, OfflineQueue};
use crate::retention::{plan_removal, ObjectGraph};
use crate::subscriptions::{Registry, SubscriptionHandle, SubscriptionStatus};
use crate::transport::{Connectivity, RemovalIntent, Transport, TransportEvent};
use crate::types::{SubscriptionId, SubscriptionState, Timestamp};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often the event loop checks for shutdown while idle.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What a named subscribe does when the name exists with a different query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NameConflictPolicy {
    /// Return the existing subscription unchanged.
    #[default]
    ReturnExisting,
    /// Fail with [`SyncError::InvalidQuery`].
    Reject,
}

/// Session configuration.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// File backing the offline queue (None = in memory).
    pub queue_path: Option<PathBuf>,

    /// Named subscribe with a conflicting query.
    pub name_conflict: NameConflictPolicy,

    /// Whether the transport is connected when the session starts.
    pub start_online: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_path: None,
            name_conflict: NameConflictPolicy::ReturnExisting,
            start_online: false,
        }
    }
}

/// Read-only view of a live subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub name: Option<String>,
    pub fingerprint: Fingerprint,
    pub created: Timestamp,
    pub status: SubscriptionStatus,
}

/// Result of handing an intent towards the server.
enum Dispatch {
    Sent,
    Queued,
    Failed(SubscriptionError),
}

/// Mutable state, only touched under the session lock.
struct SessionState {
    registry: Registry,
    queue: OfflineQueue,
    /// Removals not yet confirmed by the server.
    removals: BTreeMap<SubscriptionId, RemovalIntent>,
    online: bool,
    closed: bool,
}

pub(crate) struct SessionInner {
    config: SessionConfig,
    state: Mutex<SessionState>,
    transport: Arc<dyn Transport>,
    graph: Arc<dyn ObjectGraph>,
    events_tx: Sender<TransportEvent>,
    events_rx: Receiver<TransportEvent>,
    shutdown: AtomicBool,
}

/// Client-side subscription manager.
///
/// Owns the registry of live subscriptions. Every mutation, whether from a
/// caller or from a transport event, runs under one lock, so a subscribe
/// racing an acknowledgement for the same record never loses an update.
///
/// `subscribe` and `unsubscribe` never wait on the network. Server answers
/// arrive as [`TransportEvent`]s through [`event_sender`](Self::event_sender)
/// and are applied by [`process_events`](Self::process_events) or by the
/// background loop started with [`spawn_event_loop`](Self::spawn_event_loop).
pub struct Session {
    inner: Arc<SessionInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Create a session. With a `queue_path`, intents left over from a
    /// previous session are restored: queued subscriptions reappear as
    /// `Creating` records and pending removals are resent on reconnect.
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        graph: Arc<dyn ObjectGraph>,
    ) -> Result<Self> {
        let queue = match &config.queue_path {
            Some(path) => OfflineQueue::open(path)?,
            None => OfflineQueue::in_memory(),
        };

        let mut registry = Registry::new();
        let mut removals = BTreeMap::new();
        for queued in queue.iter() {
            match &queued.intent {
                Intent::Subscribe(intent) => registry.restore(
                    intent.id,
                    intent.name.clone(),
                    intent.fingerprint.clone(),
                    intent.created,
                ),
                Intent::Unsubscribe(intent) => {
                    registry.reserve_through(intent.id);
                    removals.insert(intent.id, intent.clone());
                }
            }
        }
        if !queue.is_empty() {
            info!(
                restored = registry.len(),
                removals = removals.len(),
                "restored queued subscription intents"
            );
        }

        let (events_tx, events_rx) = unbounded();
        let online = config.start_online;
        let inner = Arc::new(SessionInner {
            config,
            state: Mutex::new(SessionState {
                registry,
                queue,
                removals,
                online: false,
                closed: false,
            }),
            transport,
            graph,
            events_tx,
            events_rx,
            shutdown: AtomicBool::new(false),
        });

        if online {
            inner.set_connectivity(Connectivity::Online)?;
        }

        Ok(Self {
            inner,
            worker: Mutex::new(None),
        })
    }

    /// Subscribe to `query`, optionally under `name`.
    ///
    /// An equivalent live subscription (same name, or same query when
    /// unnamed) is returned as is and nothing new is submitted. Subscribing
    /// twice and unsubscribing once therefore leaves no subscription.
    ///
    /// Fails only for local problems (an invalid query, a closed session, a
    /// queue write error). Server rejections surface later as the `Error`
    /// state on the returned handle.
    pub fn subscribe(&self, query: &QuerySpec, name: Option<&str>) -> Result<SubscriptionHandle> {
        self.inner.subscribe(query, name)
    }

    /// Remove a subscription. Idempotent.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        self.inner.unsubscribe(handle.id())
    }

    /// Remove a subscription by id. Unknown ids are a no-op.
    pub fn unsubscribe_id(&self, id: SubscriptionId) -> Result<()> {
        self.inner.unsubscribe(id)
    }

    /// Channel for the transport to deliver acknowledgements on.
    pub fn event_sender(&self) -> Sender<TransportEvent> {
        self.inner.events_tx.clone()
    }

    /// Apply every event received so far. Returns how many were applied.
    pub fn process_events(&self) -> Result<usize> {
        let mut applied = 0;
        while let Ok(event) = self.inner.events_rx.try_recv() {
            self.inner.apply_event(event)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Apply a single event immediately.
    pub fn handle_event(&self, event: TransportEvent) -> Result<()> {
        self.inner.apply_event(event)
    }

    /// Start a background thread applying events as they arrive. Calling
    /// this again while the loop runs does nothing.
    pub fn spawn_event_loop(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(SyncError::SessionClosed);
        }

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("partial-sync-events".into())
            .spawn(move || inner.run_event_loop())?;
        *worker = Some(handle);
        Ok(())
    }

    /// Live subscriptions ordered by creation time.
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let state = self.inner.state.lock();
        state
            .registry
            .ordered()
            .into_iter()
            .map(|r| SubscriptionInfo {
                id: r.id(),
                name: r.name().map(str::to_string),
                fingerprint: r.fingerprint().clone(),
                created: r.created(),
                status: r.status(),
            })
            .collect()
    }

    /// Handle for the live subscription named `name`.
    pub fn find_by_name(&self, name: &str) -> Option<SubscriptionHandle> {
        let state = self.inner.state.lock();
        state
            .registry
            .find_by_name(name)
            .map(|r| SubscriptionHandle::new(r, Arc::downgrade(&self.inner)))
    }

    pub fn live_count(&self) -> usize {
        self.inner.state.lock().registry.len()
    }

    /// Removals sent or queued but not yet confirmed by the server.
    pub fn pending_removals(&self) -> Vec<RemovalIntent> {
        self.inner.state.lock().removals.values().cloned().collect()
    }

    /// Intents waiting for a connection.
    pub fn queued_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_online(&self) -> bool {
        self.inner.state.lock().online
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Stop the event loop and invalidate every handle. Queued intents stay
    /// in a durable queue for the next session. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("event loop thread panicked");
            }
        }

        let mut state = self.inner.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.online = false;
        let records = state.registry.drain();
        for record in &records {
            record.invalidate();
            record.cell().close();
        }
        info!(
            invalidated = records.len(),
            queued = state.queue.len(),
            durable = state.queue.is_durable(),
            "session closed"
        );
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Best-effort teardown on drop
        let _ = self.close();
    }
}

impl SessionInner {
    fn subscribe(self: &Arc<Self>, query: &QuerySpec, name: Option<&str>) -> Result<SubscriptionHandle> {
        let fingerprint = canonicalize(query)?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(SyncError::SessionClosed);
        }

        if let Some(existing) = state.registry.find_equivalent(name, &fingerprint) {
            if existing.fingerprint() != &fingerprint {
                match self.config.name_conflict {
                    NameConflictPolicy::Reject => {
                        return Err(SyncError::InvalidQuery(format!(
                            "subscription '{}' already exists with a different query",
                            name.unwrap_or_default()
                        )));
                    }
                    NameConflictPolicy::ReturnExisting => {
                        warn!(
                            subscription = %existing.id(),
                            name = ?name,
                            existing = %existing.fingerprint(),
                            requested = %fingerprint,
                            "name already subscribed with a different query, keeping existing"
                        );
                    }
                }
            }
            debug!(subscription = %existing.id(), name = ?name, "subscribe matched existing subscription");
            return Ok(SubscriptionHandle::new(existing, Arc::downgrade(self)));
        }

        let id = state
            .registry
            .insert(name.map(str::to_string), fingerprint, Timestamp::now());
        let (intent, handle) = {
            let record = state
                .registry
                .get(id)
                .ok_or_else(|| SyncError::Corruption(format!("{} missing after insert", id)))?;
            (record.intent(), SubscriptionHandle::new(record, Arc::downgrade(self)))
        };
        debug!(subscription = %id, name = ?name, query = %intent.fingerprint, "created subscription");

        let dispatch = self.dispatch(&mut state, Intent::Subscribe(intent))?;
        if let Some(record) = state.registry.get(id) {
            match dispatch {
                Dispatch::Sent => {
                    record.transition(SubscriptionState::Pending);
                }
                Dispatch::Queued => {}
                Dispatch::Failed(error) => {
                    record.fail(error);
                }
            }
        }
        Ok(handle)
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed || !state.registry.contains(id) {
            debug!(subscription = %id, "unsubscribe of unknown subscription ignored");
            return Ok(());
        }

        // Never sent: forget it locally, nothing to tell the server. A record
        // the server has already answered for is known there even if its
        // intent is still queued.
        let unsent = state
            .registry
            .get(id)
            .is_some_and(|r| r.state() == SubscriptionState::Creating);
        if unsent && state.queue.cancel_subscribe(id)? {
            if let Some(record) = state.registry.remove(id) {
                record.invalidate();
            }
            debug!(subscription = %id, "dropped unsent subscription");
            return Ok(());
        }

        let snapshot = self.graph.snapshot();
        let marker = plan_removal(&state.registry, id, snapshot.as_ref());
        let Some(record) = state.registry.remove(id) else {
            return Ok(());
        };
        record.invalidate();
        info!(
            subscription = %id,
            orphaned = marker.len(),
            "removing subscription"
        );

        let removal = RemovalIntent {
            id,
            key: record.key(),
            orphaned: marker.orphaned,
        };
        state.removals.insert(id, removal.clone());

        match self.dispatch(&mut state, Intent::Unsubscribe(removal))? {
            Dispatch::Sent | Dispatch::Queued => {}
            Dispatch::Failed(error) => {
                warn!(subscription = %id, error = %error, "removal rejected by transport");
                state.removals.remove(&id);
            }
        }
        Ok(())
    }

    /// Send an intent now if possible, otherwise queue it. Anything already
    /// queued goes first so issue order is preserved.
    fn dispatch(&self, state: &mut SessionState, intent: Intent) -> Result<Dispatch> {
        if !state.online || !state.queue.is_empty() {
            let seq = state.queue.enqueue(intent)?;
            debug!(seq, "queued intent while offline");
            return Ok(Dispatch::Queued);
        }

        match self.send(&intent) {
            Ok(()) => Ok(Dispatch::Sent),
            Err(err) => match SubscriptionError::from_submit_error(&err) {
                Some(error) => Ok(Dispatch::Failed(error)),
                None => {
                    warn!(error = %err, "transport unavailable, going offline");
                    state.online = false;
                    state.queue.enqueue(intent)?;
                    Ok(Dispatch::Queued)
                }
            },
        }
    }

    fn send(&self, intent: &Intent) -> Result<()> {
        match intent {
            Intent::Subscribe(i) => self.transport.submit(i),
            Intent::Unsubscribe(i) => self.transport.submit_removal(i),
        }
    }

    /// Resend queued intents in order. Stops at the first transport failure,
    /// leaving that intent at the front.
    fn replay(&self, state: &mut SessionState) -> Result<()> {
        let mut replayed = 0usize;
        while let Some(queued) = state.queue.front().cloned() {
            // Skip intents whose subscription has moved on since queueing.
            let still_wanted = match &queued.intent {
                Intent::Subscribe(i) => state
                    .registry
                    .get(i.id)
                    .is_some_and(|r| r.state() == SubscriptionState::Creating),
                Intent::Unsubscribe(i) => state.removals.contains_key(&i.id),
            };
            if !still_wanted {
                state.queue.complete(queued.seq)?;
                continue;
            }

            match self.send(&queued.intent) {
                Ok(()) => {
                    state.queue.complete(queued.seq)?;
                    replayed += 1;
                    if let Intent::Subscribe(i) = &queued.intent {
                        if let Some(record) = state.registry.get(i.id) {
                            record.transition(SubscriptionState::Pending);
                        }
                    }
                }
                Err(err) => match SubscriptionError::from_submit_error(&err) {
                    None => {
                        warn!(error = %err, remaining = state.queue.len(), "replay interrupted");
                        state.online = false;
                        break;
                    }
                    Some(error) => {
                        state.queue.complete(queued.seq)?;
                        match &queued.intent {
                            Intent::Subscribe(i) => {
                                if let Some(record) = state.registry.get(i.id) {
                                    record.fail(error);
                                }
                            }
                            Intent::Unsubscribe(i) => {
                                warn!(subscription = %i.id, error = %error, "queued removal rejected");
                                state.removals.remove(&i.id);
                            }
                        }
                    }
                },
            }
        }
        if replayed > 0 {
            info!(replayed, "replayed queued intents");
        }
        Ok(())
    }

    fn set_connectivity(&self, connectivity: Connectivity) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        match connectivity {
            Connectivity::Online => {
                if !state.online {
                    info!(queued = state.queue.len(), "transport online");
                }
                state.online = true;
                self.replay(&mut state)
            }
            Connectivity::Offline => {
                if state.online {
                    info!("transport offline");
                }
                state.online = false;
                Ok(())
            }
        }
    }

    fn apply_event(&self, event: TransportEvent) -> Result<()> {
        let id = match &event {
            TransportEvent::ConnectivityChanged { state } => return self.set_connectivity(*state),
            TransportEvent::RemovalConfirmed { id } => {
                let mut state = self.state.lock();
                if state.removals.remove(id).is_some() {
                    debug!(subscription = %id, "removal confirmed");
                } else {
                    debug!(subscription = %id, "ignoring confirmation for unknown removal");
                }
                return Ok(());
            }
            TransportEvent::Acknowledged { id }
            | TransportEvent::Completed { id }
            | TransportEvent::Rejected { id, .. } => *id,
        };

        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        let Some(record) = state.registry.get(id) else {
            debug!(subscription = %id, "ignoring event for removed subscription");
            return Ok(());
        };

        match event {
            TransportEvent::Acknowledged { .. } => {
                record.transition(SubscriptionState::Pending);
                // The server has it; a queued copy must not be resent.
                state.queue.cancel_subscribe(id)?;
            }
            TransportEvent::Completed { .. } => {
                if record.state() == SubscriptionState::Creating {
                    record.transition(SubscriptionState::Pending);
                }
                record.transition(SubscriptionState::Complete);
                state.queue.cancel_subscribe(id)?;
            }
            TransportEvent::Rejected { error, .. } => {
                warn!(subscription = %id, error = %error, "subscription rejected by server");
                if record.fail(error) {
                    // A rejected subscription must not be resent on reconnect.
                    state.queue.cancel_subscribe(id)?;
                }
            }
            TransportEvent::ConnectivityChanged { .. } | TransportEvent::RemovalConfirmed { .. } => {}
        }
        Ok(())
    }

    fn run_event_loop(self: Arc<Self>) {
        debug!("event loop started");
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.events_rx.recv_timeout(EVENT_POLL_INTERVAL) {
                Ok(event) => {
                    if let Err(e) = self.apply_event(event) {
                        warn!(error = %e, "failed to apply transport event");
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("event loop stopped");
    }
}
