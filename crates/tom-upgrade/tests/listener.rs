//! Inbound path: admission, identity binding, gating and hole-punch delivery.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tom_upgrade::test_utils::{
    peer_id, public_key, quic_addr, remote_addr, CountingResourceManager, MockGater,
    MockListenerHandle, MockRawTransport, MockSession, MockUpgrader,
};
use tom_upgrade::{
    CloseCode, DirectTransport, Direction, HolePunchKey, Listener, Multiaddr, ResourceManager,
    SessionVersion, Transport, TransportConfig, TransportCore, UpgradeError,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

struct Harness {
    transport: DirectTransport,
    raw: Arc<MockRawTransport>,
    rcmgr: Arc<CountingResourceManager>,
    upgrader: Arc<MockUpgrader>,
}

fn harness(gater: Option<Arc<MockGater>>) -> Harness {
    init_tracing();
    let config = TransportConfig::default();
    let raw = Arc::new(MockRawTransport::new());
    let rcmgr = Arc::new(CountingResourceManager::new());
    let upgrader = Arc::new(MockUpgrader::new());
    let mut core = TransportCore::new(peer_id(0), &config)
        .with_resource_manager(rcmgr.clone())
        .with_upgrader(upgrader.clone());
    if let Some(gater) = gater {
        core = core.with_gater(gater);
    }
    let transport = DirectTransport::new(raw.clone(), core, config).unwrap();
    Harness {
        transport,
        raw,
        rcmgr,
        upgrader,
    }
}

fn listen_addr() -> Multiaddr {
    quic_addr(SocketAddr::from(([192, 0, 2, 1], 4001)))
}

async fn listen(h: &Harness) -> (Listener, MockListenerHandle) {
    let listener = h.transport.listen(&listen_addr()).await.unwrap();
    let handle = h.raw.listener_handle(0).unwrap();
    (listener, handle)
}

fn secured(seed: u8) -> Arc<MockSession> {
    MockSession::new(remote_addr(seed))
        .secured_by(&public_key(seed))
        .into_arc()
}

async fn accept(listener: &Listener) -> Result<tom_upgrade::CapableConn, UpgradeError> {
    tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("accept timed out")
}

#[tokio::test]
async fn accepts_and_binds_identity() {
    let h = harness(None);
    let (listener, handle) = listen(&h).await;
    assert_eq!(listener.multiaddrs(), vec![listen_addr()]);

    handle.push(secured(1));
    let conn = accept(&listener).await.unwrap();

    assert_eq!(conn.remote_peer(), peer_id(1));
    assert_eq!(conn.local_peer(), peer_id(0));
    assert_eq!(conn.remote_public_key(), &public_key(1));
    assert_eq!(conn.remote_multiaddr(), &quic_addr(remote_addr(1)));
    assert_eq!(conn.local_multiaddr(), &listen_addr());
    assert_eq!(conn.stat().direction, Direction::Inbound);
    assert!(!conn.stat().relayed);
    assert_eq!(h.transport.connections().len(), 1);
    assert_eq!(h.transport.peer_public_key(&peer_id(1)), Some(public_key(1)));

    let scopes = h.rcmgr.scopes();
    assert_eq!(scopes.len(), 1);
    assert_eq!(scopes[0].direction, Direction::Inbound);
    assert_eq!(scopes[0].peer(), Some(peer_id(1)));
    assert_eq!(h.rcmgr.outstanding(), 1);

    drop(conn);
    assert!(h.rcmgr.all_released_once());
    assert!(h.transport.connections().is_empty());
}

#[tokio::test]
async fn unsecured_session_goes_through_upgrader() {
    let h = harness(None);
    let (listener, handle) = listen(&h).await;
    h.upgrader.expect(remote_addr(4), public_key(4));

    handle.push(MockSession::new(remote_addr(4)).into_arc());
    let conn = accept(&listener).await.unwrap();

    assert_eq!(conn.remote_peer(), peer_id(4));
    assert_eq!(h.upgrader.calls(), vec![(Direction::Inbound, None)]);
    assert_eq!(h.upgrader.secured_sessions().len(), 1);
}

#[tokio::test]
async fn rejected_peer_is_closed_and_loop_continues() {
    let h = harness(None);
    let (listener, handle) = listen(&h).await;
    h.rcmgr.reject_peer(peer_id(1));

    let rejected = secured(1);
    handle.push(rejected.clone());
    handle.push(secured(2));

    let conn = accept(&listener).await.unwrap();
    assert_eq!(conn.remote_peer(), peer_id(2));
    assert_eq!(rejected.close_codes(), vec![CloseCode::ResourceLimitExceeded]);

    let scopes = h.rcmgr.scopes();
    assert_eq!(scopes.len(), 2);
    assert_eq!(scopes[0].releases(), 1);
    assert_eq!(scopes[1].releases(), 0);
    assert!(h.rcmgr.never_double_released());
}

#[tokio::test]
async fn rejected_upgraded_peer_closes_both_sessions() {
    let h = harness(None);
    let (listener, handle) = listen(&h).await;
    h.upgrader.expect(remote_addr(1), public_key(1));
    h.rcmgr.reject_peer(peer_id(1));

    let raw = MockSession::new(remote_addr(1)).into_arc();
    handle.push(raw.clone());
    handle.push(secured(2));

    let conn = accept(&listener).await.unwrap();
    assert_eq!(conn.remote_peer(), peer_id(2));

    let upgraded = h.upgrader.secured_sessions();
    assert_eq!(upgraded.len(), 1);
    assert_eq!(raw.close_codes(), vec![CloseCode::ResourceLimitExceeded]);
    assert_eq!(upgraded[0].close_codes(), vec![CloseCode::ResourceLimitExceeded]);
    assert!(h.rcmgr.never_double_released());
}

#[tokio::test]
async fn resource_limit_on_open_releases_nothing() {
    let h = harness(None);
    let (listener, handle) = listen(&h).await;
    h.rcmgr.reject_all();

    let session = secured(1);
    handle.push(session.clone());
    handle.fail("listener shut down");

    let err = accept(&listener).await.unwrap_err();
    assert!(matches!(err, UpgradeError::Accept(_)));
    assert_eq!(session.close_codes(), vec![CloseCode::ResourceLimitExceeded]);
    assert_eq!(h.rcmgr.opened(), 0);
}

#[tokio::test]
async fn failed_handshake_releases_scope_once() {
    let h = harness(None);
    let (listener, handle) = listen(&h).await;
    h.upgrader.fail_all();

    let session = MockSession::new(remote_addr(1)).into_arc();
    handle.push(session.clone());
    handle.fail("listener shut down");

    assert!(accept(&listener).await.is_err());
    assert_eq!(session.close_codes(), vec![CloseCode::ResourceLimitExceeded]);
    assert_eq!(h.rcmgr.opened(), 1);
    assert!(h.rcmgr.all_released_once());
}

#[tokio::test]
async fn session_without_certificate_is_rejected() {
    let h = harness(None);
    let (listener, handle) = listen(&h).await;

    // Certificates present but not a raw Ed25519 key.
    let bogus = MockSession::new(remote_addr(1))
        .with_certs(vec![webpki_cert(b"not a key")])
        .into_arc();
    handle.push(bogus.clone());
    handle.push(secured(2));

    let conn = accept(&listener).await.unwrap();
    assert_eq!(conn.remote_peer(), peer_id(2));
    assert!(bogus.is_closed());
    assert_eq!(h.rcmgr.scopes()[0].releases(), 1);
}

fn webpki_cert(bytes: &[u8]) -> webpki_types::CertificateDer<'static> {
    webpki_types::CertificateDer::from(bytes.to_vec())
}

#[tokio::test]
async fn unknown_session_version_is_rejected() {
    let h = harness(None);
    let (listener, handle) = listen(&h).await;

    // The direct listener has no local circuit address.
    let circuit = MockSession::new(remote_addr(1))
        .secured_by(&public_key(1))
        .with_version(SessionVersion::Circuit)
        .into_arc();
    // Draft-29 cannot even be expressed as a multiaddr.
    let draft = MockSession::new(remote_addr(2))
        .secured_by(&public_key(2))
        .with_version(SessionVersion::QuicDraft29)
        .into_arc();
    handle.push(circuit.clone());
    handle.push(draft.clone());
    handle.push(secured(3));

    let conn = accept(&listener).await.unwrap();
    assert_eq!(conn.remote_peer(), peer_id(3));
    assert_eq!(circuit.close_codes(), vec![CloseCode::ResourceLimitExceeded]);
    assert_eq!(draft.close_codes(), vec![CloseCode::ResourceLimitExceeded]);

    // No scope was opened for the draft-29 session.
    assert_eq!(h.rcmgr.opened(), 2);
    assert_eq!(h.rcmgr.scopes()[0].releases(), 1);
}

#[tokio::test]
async fn attached_scope_is_used_instead_of_a_new_one() {
    let h = harness(None);
    let (listener, handle) = listen(&h).await;

    let scope = h
        .rcmgr
        .open_connection(Direction::Inbound, false, &quic_addr(remote_addr(1)))
        .unwrap();
    handle.push(
        MockSession::new(remote_addr(1))
            .secured_by(&public_key(1))
            .with_scope(scope)
            .into_arc(),
    );

    let conn = accept(&listener).await.unwrap();
    assert_eq!(h.rcmgr.opened(), 1);
    assert_eq!(h.rcmgr.scopes()[0].peer(), Some(peer_id(1)));

    drop(conn);
    assert!(h.rcmgr.all_released_once());
}

#[tokio::test]
async fn gater_refusal_closes_with_gated() {
    let gater = Arc::new(MockGater::deny_all());
    let h = harness(Some(gater.clone()));
    let (listener, handle) = listen(&h).await;

    let session = secured(1);
    handle.push(session.clone());
    handle.fail("listener shut down");

    assert!(accept(&listener).await.is_err());
    assert_eq!(session.close_codes(), vec![CloseCode::Gated]);
    assert_eq!(gater.accept_calls(), 1);
    assert_eq!(gater.secured_calls(), 0);
    assert!(h.rcmgr.all_released_once());
    assert!(h.transport.connections().is_empty());
}

#[tokio::test]
async fn gater_sees_secured_identity() {
    let gater = Arc::new(MockGater::deny_peer(peer_id(1)));
    let h = harness(Some(gater.clone()));
    let (listener, handle) = listen(&h).await;

    let denied = secured(1);
    handle.push(denied.clone());
    handle.push(secured(2));

    let conn = accept(&listener).await.unwrap();
    assert_eq!(conn.remote_peer(), peer_id(2));
    assert_eq!(denied.close_codes(), vec![CloseCode::Gated]);
    assert_eq!(gater.secured_calls(), 2);
}

#[tokio::test]
async fn hole_punch_gets_first_session_and_accept_gets_duplicate() {
    let h = harness(None);
    let (listener, handle) = listen(&h).await;

    let key = HolePunchKey::new(remote_addr(1), peer_id(1));
    let mut ticket = h.transport.hole_punch_registry().register(key.clone()).unwrap();

    let first = secured(1);
    let second = secured(1);
    handle.push(first.clone());
    handle.push(second.clone());

    let returned = accept(&listener).await.unwrap();
    assert_eq!(returned.remote_peer(), peer_id(1));
    assert_eq!(h.transport.hole_punch_registry().is_fulfilled(&key), Some(true));

    let mut delivered = ticket.recv().await.unwrap();
    assert_eq!(delivered.remote_peer(), peer_id(1));

    delivered.close();
    assert!(first.is_closed());
    assert!(!second.is_closed());

    drop(ticket);
    assert!(h.transport.hole_punch_registry().is_empty());
}

#[tokio::test]
async fn gated_session_never_completes_hole_punch() {
    let h = harness(Some(Arc::new(MockGater::deny_all())));
    let (listener, handle) = listen(&h).await;

    let key = HolePunchKey::new(remote_addr(1), peer_id(1));
    let mut ticket = h.transport.hole_punch_registry().register(key.clone()).unwrap();

    handle.push(secured(1));
    handle.fail("listener shut down");
    assert!(accept(&listener).await.is_err());

    assert_eq!(h.transport.hole_punch_registry().is_fulfilled(&key), Some(false));
    let waited = tokio::time::timeout(Duration::from_millis(50), ticket.recv()).await;
    assert!(waited.is_err());
}

#[tokio::test]
async fn other_peer_at_punched_address_is_returned() {
    let h = harness(None);
    let (listener, handle) = listen(&h).await;

    let key = HolePunchKey::new(remote_addr(1), peer_id(1));
    let _ticket = h.transport.hole_punch_registry().register(key.clone()).unwrap();

    // Same address, different identity.
    handle.push(
        MockSession::new(remote_addr(1))
            .secured_by(&public_key(7))
            .into_arc(),
    );
    let conn = accept(&listener).await.unwrap();
    assert_eq!(conn.remote_peer(), peer_id(7));
    assert_eq!(h.transport.hole_punch_registry().is_fulfilled(&key), Some(false));
}

#[tokio::test]
async fn closed_listener_stops_accepting() {
    let h = harness(None);
    let (listener, _handle) = listen(&h).await;

    listener.close().await.unwrap();
    let err = accept(&listener).await.unwrap_err();
    assert!(matches!(err, UpgradeError::ListenerClosed));
}

#[tokio::test]
async fn listen_rejects_circuit_address() {
    let h = harness(None);
    let addr = listen_addr().with(tom_upgrade::Protocol::P2pCircuit);
    let err = h.transport.listen(&addr).await.err().unwrap();
    assert!(matches!(err, UpgradeError::UnsupportedAddr(_)));
}
