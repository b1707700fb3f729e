//! End-to-end tests driving a full `Runner` (engine thread, command
//! queue, and `RunnerHandle`) rather than the lower-level `Dht`/`SecureDht`
//! types the unit tests inside `src/` already cover directly.

use lib_dht::crypto::{Certificate, DefaultCryptoProvider};
use lib_dht::{CryptoProvider, Identity, IdHash, RunnerConfig, Transport};
use std::net::SocketAddr;
use std::time::Duration;

fn signed_identity() -> Identity {
    let provider = DefaultCryptoProvider;
    let (private_key, public_key) = provider.generate_identity();
    let id = public_key.fingerprint();
    Identity { private_key: Some(private_key), certificate: Some(Certificate { id, public_key, der: Vec::new(), issuer: None }) }
}

fn config_at(port: u16, bootstrap: Vec<SocketAddr>) -> RunnerConfig {
    RunnerConfig {
        transport: Transport::Udp { bind_v4: format!("127.0.0.1:{port}").parse().unwrap(), bind_v6: None },
        bootstrap,
        periodic_interval: Duration::from_millis(50),
        ..RunnerConfig::default()
    }
}

#[test]
fn two_nodes_bootstrap_and_ping_each_other() {
    let a_id = IdHash::hash(b"runner-test-node-a");
    let a = lib_dht::Runner::run(a_id, Identity::anonymous(), config_at(34201, vec![])).unwrap();
    let a_handle = a.handle();

    let b_id = IdHash::hash(b"runner-test-node-b");
    let a_addr: SocketAddr = "127.0.0.1:34201".parse().unwrap();
    let b = lib_dht::Runner::run(b_id, Identity::anonymous(), config_at(34202, vec![a_addr])).unwrap();
    let b_handle = b.handle();

    std::thread::sleep(Duration::from_millis(200));

    b_handle.ping(a_addr).expect("ping should reach the bootstrap node");
    std::thread::sleep(Duration::from_millis(200));

    let a_stats = a_handle.stats().unwrap();
    assert_eq!(a_stats.malformed_packets, 0, "node A should have understood the ping, not discarded it");
}

#[test]
fn put_unsigned_then_get_roundtrips_on_a_single_node() {
    let own_id = IdHash::hash(b"runner-test-solo-node");
    let runner = lib_dht::Runner::run(own_id, Identity::anonymous(), config_at(34203, vec![])).unwrap();
    let handle = runner.handle();

    let key = IdHash::hash(b"solo-key");
    handle.put_unsigned(key, b"hello dht".to_vec(), "text", None).unwrap();

    let values = handle.get(key).unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].data, b"hello dht");
    assert!(values[0].owner.is_none());
}

#[test]
fn put_signed_then_get_carries_the_owner() {
    let own_id = IdHash::hash(b"runner-test-signed-node");
    let runner = lib_dht::Runner::run(own_id, signed_identity(), config_at(34204, vec![])).unwrap();
    let handle = runner.handle();

    let key = IdHash::hash(b"signed-key");
    handle.put_signed(key, b"signed payload".to_vec(), "text", None).unwrap();

    let values = handle.get(key).unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].data, b"signed payload");
    assert!(values[0].owner.is_some(), "a signed put should carry an owner");
}

#[test]
fn persisted_state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let persist_path = dir.path().join("node.state");
    let own_id = IdHash::hash(b"runner-test-persist-node");
    let key = IdHash::hash(b"persist-key");

    {
        let mut config = config_at(34205, vec![]);
        config.persist_path = Some(persist_path.clone());
        let runner = lib_dht::Runner::run(own_id, Identity::anonymous(), config).unwrap();
        let handle = runner.handle();
        handle.put_unsigned(key, b"still here".to_vec(), "text", None).unwrap();
        // Runner's Drop triggers the engine thread's shutdown-time persist.
    }

    assert!(persist_path.exists(), "persisted state file should have been written on shutdown");

    {
        let mut config = config_at(34206, vec![]);
        config.persist_path = Some(persist_path.clone());
        let runner = lib_dht::Runner::run(own_id, Identity::anonymous(), config).unwrap();
        let handle = runner.handle();

        let values = handle.get(key).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].data, b"still here");
    }
}

#[test]
fn shutdown_is_idempotent() {
    let own_id = IdHash::hash(b"runner-test-shutdown-node");
    let runner = lib_dht::Runner::run(own_id, Identity::anonymous(), config_at(34207, vec![])).unwrap();
    let handle = runner.handle();

    handle.shutdown();
    handle.shutdown();

    assert!(matches!(handle.stats(), Err(lib_dht::DhtError::NotRunning)));
}

#[test]
fn listen_registration_can_be_cancelled_without_panicking() {
    let own_id = IdHash::hash(b"runner-test-listen-node");
    let runner = lib_dht::Runner::run(own_id, Identity::anonymous(), config_at(34208, vec![])).unwrap();
    let handle = runner.handle();

    let key = IdHash::hash(b"listen-key");
    let (listen_handle, _rx) = handle.listen(key).unwrap();
    handle.cancel_listen(listen_handle);
}

#[test]
fn cancel_put_via_runner_removes_the_value() {
    let own_id = IdHash::hash(b"runner-test-cancel-put-node");
    let runner = lib_dht::Runner::run(own_id, Identity::anonymous(), config_at(34209, vec![])).unwrap();
    let handle = runner.handle();

    let key = IdHash::hash(b"cancel-put-key");
    let id = handle.put_unsigned(key, b"temporary".to_vec(), "text", Some(Duration::from_secs(60))).unwrap();
    assert!(handle.get(key).is_ok());

    handle.cancel_put(key, id);
    std::thread::sleep(Duration::from_millis(50));
    assert!(handle.get(key).is_err(), "cancelled value should no longer be servable from this node");
}
