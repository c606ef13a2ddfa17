//! Control-channel integration tests over real TLS on loopback.
//!
//! These cover everything that does not need an RDMA device: the PSN
//! exchange through `ServerChannel`, the cipher policy, and the
//! three-way disconnect with its timeout fallbacks.

mod common;

use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use codec::Psn;
use rdma_server::config;
use rdma_server::tls::{ServerChannel, server_config};
use service::channel::SentinelReader;
use service::handshake::PsnSent;
use service::{DisconnectOutcome, DisconnectTimers, disconnect};

use common::{TestCerts, TestChannel};

fn tls_pair(tag: &str) -> (ServerChannel, TestChannel) {
    let certs = TestCerts::generate(tag);

    let tls = config::Tls {
        cert: certs.cert_path.clone(),
        key: certs.key_path.clone(),
        ..config::Tls::default()
    };
    let server_cfg = server_config(&tls).unwrap();
    let client_cfg = certs.client_config();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let accept = thread::spawn(move || {
        let (tcp, _) = listener.accept().unwrap();
        ServerChannel::accept(server_cfg, tcp).unwrap()
    });

    let client = TestChannel::connect(client_cfg, TcpStream::connect(addr).unwrap());
    (accept.join().unwrap(), client)
}

fn fast_timers() -> DisconnectTimers {
    DisconnectTimers {
        req_ack: Duration::from_millis(400),
        ack_fin: Duration::from_millis(300),
        fin_linger: Duration::from_millis(10),
    }
}

#[test]
fn negotiated_protocol_is_tls12_or_newer() {
    let (server, client) = tls_pair("proto");

    let version = client.stream.conn.protocol_version().unwrap();
    assert!(
        matches!(
            version,
            rustls::ProtocolVersion::TLSv1_2 | rustls::ProtocolVersion::TLSv1_3,
        ),
        "unexpected protocol version: {:?}",
        version,
    );

    drop(server);
}

#[test]
fn psn_exchange_is_symmetric_over_tls() {
    let (mut server, mut client) = tls_pair("psn");

    let server_psn = Psn::new(0x9f8541).unwrap();
    let client_psn = Psn::new(0x2807d5).unwrap();

    let server_side = thread::spawn(move || {
        PsnSent::announce(&mut server, server_psn)
            .unwrap()
            .recv_peer(&mut server)
            .unwrap()
    });

    let client_state = PsnSent::announce(&mut client, client_psn)
        .unwrap()
        .recv_peer(&mut client)
        .unwrap();
    let server_state = server_side.join().unwrap();

    // Each side's remote is the other side's local.
    assert_eq!(client_state.remote(), server_psn);
    assert_eq!(server_state.remote(), client_psn);
}

#[test]
fn rigged_identical_psns_fail_before_any_qp_exists() {
    let (mut server, mut client) = tls_pair("collision");

    let psn = Psn::new(0x00c0de).unwrap();

    let server_side = thread::spawn(move || {
        PsnSent::announce(&mut server, psn)
            .unwrap()
            .recv_peer(&mut server)
    });

    let client_result = PsnSent::announce(&mut client, psn)
        .unwrap()
        .recv_peer(&mut client);

    assert!(matches!(
        client_result,
        Err(service::SessionError::PsnCollision(_))
    ));
    assert!(matches!(
        server_side.join().unwrap(),
        Err(service::SessionError::PsnCollision(_))
    ));
}

#[test]
fn disconnect_three_way_over_tls() {
    let (mut server, mut client) = tls_pair("disconnect");
    let timers = fast_timers();

    let responder = thread::spawn(move || {
        let mut reader = SentinelReader::default();
        let req = reader
            .wait(&mut server, Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(req, codec::Sentinel::Req);
        disconnect::respond(&mut server, &fast_timers())
    });

    assert_eq!(
        disconnect::initiate(&mut client, &timers),
        DisconnectOutcome::Graceful,
    );
    assert_eq!(responder.join().unwrap(), DisconnectOutcome::Graceful);
}

#[test]
fn initiator_times_out_when_responder_is_halted() {
    let (server, mut client) = tls_pair("halted");
    let timers = fast_timers();

    // The server end never reads nor answers; the initiator must force
    // teardown once the REQ->ACK window passes.
    let outcome = disconnect::initiate(&mut client, &timers);
    assert_eq!(outcome, DisconnectOutcome::Forced);

    drop(server);
}

#[test]
fn responder_times_out_without_fin() {
    let (mut server, mut client) = tls_pair("nofin");

    let responder = thread::spawn(move || {
        let mut reader = SentinelReader::default();
        let req = reader
            .wait(&mut server, Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(req, codec::Sentinel::Req);
        disconnect::respond(&mut server, &fast_timers())
    });

    // Send REQ, swallow the ACK, never send FIN.
    service::channel::send_sentinel(&mut client, codec::Sentinel::Req).unwrap();
    let mut reader = SentinelReader::default();
    let ack = reader
        .wait(&mut client, Duration::from_secs(2))
        .unwrap()
        .unwrap();
    assert_eq!(ack, codec::Sentinel::Ack);

    assert_eq!(responder.join().unwrap(), DisconnectOutcome::Forced);
}

#[test]
fn handshake_refused_for_untrusted_client_roots() {
    let certs = TestCerts::generate("untrusted");
    let other = TestCerts::generate("other");

    let tls = config::Tls {
        cert: certs.cert_path.clone(),
        key: certs.key_path.clone(),
        ..config::Tls::default()
    };
    let server_cfg = server_config(&tls).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let accept = thread::spawn(move || {
        let (tcp, _) = listener.accept().unwrap();
        ServerChannel::accept(server_cfg, tcp)
    });

    // The client trusts a different root, so verification must fail and
    // the server must see a failed handshake, not a session.
    let name = rustls::pki_types::ServerName::try_from("localhost".to_owned()).unwrap();
    let conn =
        rustls::ClientConnection::new(other.client_config(), name).unwrap();
    let mut stream =
        rustls::StreamOwned::new(conn, TcpStream::connect(addr).unwrap());

    let mut failed = false;
    while stream.conn.is_handshaking() {
        if stream.conn.complete_io(&mut stream.sock).is_err() {
            failed = true;
            break;
        }
    }

    assert!(failed, "client accepted an untrusted certificate");
    assert!(accept.join().unwrap().is_err());
}
