//! Offline queue and replay tests.

use partial_sync::{
    Connectivity, MemoryGraph, QuerySpec, RecordingTransport, Session, SessionConfig, Submission,
    SubscriptionState, SyncError, TransportEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn offline_session(config: SessionConfig) -> (Session, Arc<RecordingTransport>) {
    init_tracing();
    let transport = Arc::new(RecordingTransport::new());
    transport.set_reachable(false);
    let session = Session::new(config, transport.clone(), Arc::new(MemoryGraph::new())).unwrap();
    (session, transport)
}

fn go_online(session: &Session, transport: &RecordingTransport) {
    transport.set_reachable(true);
    session
        .handle_event(TransportEvent::ConnectivityChanged {
            state: Connectivity::Online,
        })
        .unwrap();
}

fn dogs() -> QuerySpec {
    QuerySpec::new("Dog").filter("age > 3")
}

#[test]
fn test_disconnect_during_creating_yields_single_pending() {
    let (session, transport) = offline_session(SessionConfig::default());

    let handle = session.subscribe(&dogs(), Some("n")).unwrap();
    let again = session.subscribe(&dogs(), Some("n")).unwrap();
    assert_eq!(handle, again);
    assert_eq!(handle.state(), SubscriptionState::Creating);
    assert_eq!(session.queued_len(), 1);

    let observer = handle.observe();
    go_online(&session, &transport);
    // A second online signal must not resend anything.
    go_online(&session, &transport);

    let pending: Vec<_> = observer
        .drain()
        .into_iter()
        .filter(|c| c.to == SubscriptionState::Pending)
        .collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(transport.subscribe_count(handle.id()), 1);
    assert_eq!(session.queued_len(), 0);
}

#[test]
fn test_replay_preserves_issue_order() {
    let (session, transport) = offline_session(SessionConfig::default());

    let a = session.subscribe(&dogs(), Some("a")).unwrap();
    go_online(&session, &transport);
    assert_eq!(a.state(), SubscriptionState::Pending);

    // Connection drops.
    transport.set_reachable(false);
    session
        .handle_event(TransportEvent::ConnectivityChanged {
            state: Connectivity::Offline,
        })
        .unwrap();

    let b = session.subscribe(&QuerySpec::new("Cat"), Some("b")).unwrap();
    a.unsubscribe().unwrap();
    let c = session.subscribe(&QuerySpec::new("Bird"), None).unwrap();
    assert_eq!(session.queued_len(), 3);

    go_online(&session, &transport);

    let replayed: Vec<_> = transport
        .submissions()
        .into_iter()
        .skip(1)
        .map(|s| match s {
            Submission::Subscribe(i) => ("subscribe", i.id),
            Submission::Remove(i) => ("remove", i.id),
        })
        .collect();
    assert_eq!(
        replayed,
        vec![
            ("subscribe", b.id()),
            ("remove", a.id()),
            ("subscribe", c.id()),
        ]
    );
    assert_eq!(b.state(), SubscriptionState::Pending);
    assert_eq!(c.state(), SubscriptionState::Pending);
}

#[test]
fn test_transport_failure_mid_submission_is_queued() {
    let transport = Arc::new(RecordingTransport::new());
    let session = Session::new(
        SessionConfig {
            start_online: true,
            ..Default::default()
        },
        transport.clone(),
        Arc::new(MemoryGraph::new()),
    )
    .unwrap();
    assert!(session.is_online());

    transport.set_reachable(false);
    let handle = session.subscribe(&dogs(), None).unwrap();
    assert_eq!(handle.state(), SubscriptionState::Creating);
    assert!(handle.error().is_none());
    assert!(!session.is_online());

    go_online(&session, &transport);
    assert_eq!(handle.state(), SubscriptionState::Pending);
    assert_eq!(transport.subscribe_count(handle.id()), 1);
}

#[test]
fn test_offline_unsubscribe_defers_removal() {
    let (session, transport) = offline_session(SessionConfig::default());
    go_online(&session, &transport);
    let handle = session.subscribe(&dogs(), None).unwrap();

    transport.set_reachable(false);
    session
        .handle_event(TransportEvent::ConnectivityChanged {
            state: Connectivity::Offline,
        })
        .unwrap();
    handle.unsubscribe().unwrap();
    handle.unsubscribe().unwrap();

    assert_eq!(handle.state(), SubscriptionState::Invalidated);
    assert_eq!(session.queued_len(), 1);
    assert_eq!(transport.removal_count(handle.id()), 0);

    go_online(&session, &transport);
    go_online(&session, &transport);
    assert_eq!(transport.removal_count(handle.id()), 1);
}

#[test]
fn test_unsubscribe_after_server_completed_queued_subscription_sends_removal() {
    let (session, transport) = offline_session(SessionConfig::default());
    let handle = session.subscribe(&dogs(), None).unwrap();

    // The server answers for a subscription whose intent is still queued.
    session
        .handle_event(TransportEvent::Completed { id: handle.id() })
        .unwrap();
    assert_eq!(handle.state(), SubscriptionState::Complete);
    assert_eq!(session.queued_len(), 0);

    handle.unsubscribe().unwrap();
    assert_eq!(handle.state(), SubscriptionState::Invalidated);
    assert_eq!(session.pending_removals().len(), 1);
    assert_eq!(session.queued_len(), 1);

    go_online(&session, &transport);
    assert_eq!(transport.removal_count(handle.id()), 1);
    assert_eq!(transport.subscribe_count(handle.id()), 0);
}

#[test]
fn test_acknowledged_queued_subscription_is_not_resent() {
    let (session, transport) = offline_session(SessionConfig::default());
    let handle = session.subscribe(&dogs(), Some("acked")).unwrap();

    session
        .handle_event(TransportEvent::Acknowledged { id: handle.id() })
        .unwrap();
    assert_eq!(handle.state(), SubscriptionState::Pending);
    assert_eq!(session.queued_len(), 0);

    go_online(&session, &transport);
    assert_eq!(transport.subscribe_count(handle.id()), 0);

    handle.unsubscribe().unwrap();
    assert_eq!(transport.removal_count(handle.id()), 1);
}

#[test]
fn test_rejected_while_queued_is_not_replayed() {
    let (session, transport) = offline_session(SessionConfig::default());
    let handle = session.subscribe(&dogs(), None).unwrap();

    session
        .handle_event(TransportEvent::Rejected {
            id: handle.id(),
            error: partial_sync::SubscriptionError::rejected("quota exceeded"),
        })
        .unwrap();
    assert_eq!(session.queued_len(), 0);

    go_online(&session, &transport);
    assert_eq!(transport.subscribe_count(handle.id()), 0);
    assert_eq!(handle.state(), SubscriptionState::Error);
}

#[test]
fn test_replay_rejection_marks_error() {
    let (session, transport) = offline_session(SessionConfig::default());
    let handle = session.subscribe(&dogs().limit(3), None).unwrap();

    transport.reject_next(SyncError::UnsupportedFeature("limit".into()));
    go_online(&session, &transport);

    let status = handle.status();
    assert_eq!(status.state, SubscriptionState::Error);
    assert!(status.error.is_some());
    assert_eq!(session.queued_len(), 0);
}

#[test]
fn test_queued_subscriptions_survive_restart() {
    let dir = TempDir::new().unwrap();
    let config = SessionConfig {
        queue_path: Some(dir.path().join("queue.bin")),
        ..Default::default()
    };

    let (id, name) = {
        let (session, _) = offline_session(config.clone());
        let handle = session.subscribe(&dogs(), Some("persisted")).unwrap();
        session.close().unwrap();
        assert_eq!(handle.state(), SubscriptionState::Invalidated);
        (handle.id(), handle.name().map(str::to_string))
    };

    let (session, transport) = offline_session(config);
    let restored = session.find_by_name("persisted").unwrap();
    assert_eq!(restored.id(), id);
    assert_eq!(restored.name().map(str::to_string), name);
    assert_eq!(restored.state(), SubscriptionState::Creating);

    // New subscriptions do not reuse restored ids.
    let other = session.subscribe(&QuerySpec::new("Cat"), None).unwrap();
    assert!(other.id() > id);

    go_online(&session, &transport);
    assert_eq!(transport.subscribe_count(id), 1);
    assert_eq!(restored.state(), SubscriptionState::Pending);
}

#[test]
fn test_two_sessions_cannot_share_a_queue() {
    let dir = TempDir::new().unwrap();
    let config = SessionConfig {
        queue_path: Some(dir.path().join("queue.bin")),
        ..Default::default()
    };

    let (_first, _) = offline_session(config.clone());
    let second = Session::new(
        config,
        Arc::new(RecordingTransport::new()),
        Arc::new(MemoryGraph::new()),
    );
    assert!(matches!(second, Err(SyncError::Locked)));
}

#[test]
fn test_event_loop_replays_on_reconnect() {
    let (session, transport) = offline_session(SessionConfig::default());
    session.spawn_event_loop().unwrap();
    let handle = session.subscribe(&dogs(), None).unwrap();

    transport.set_reachable(true);
    let events = session.event_sender();
    events
        .send(TransportEvent::ConnectivityChanged {
            state: Connectivity::Online,
        })
        .unwrap();
    events.send(TransportEvent::Completed { id: handle.id() }).unwrap();

    let status = handle
        .wait_for(|s| s.state == SubscriptionState::Complete, Duration::from_secs(5))
        .unwrap();
    assert!(status.error.is_none());
    assert_eq!(transport.subscribe_count(handle.id()), 1);
    session.close().unwrap();
}
