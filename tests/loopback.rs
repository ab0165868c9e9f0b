//! Integration tests over 127.0.0.1: framed transport, the encrypted
//! file stream path end-to-end, and the engine demux fed through a real
//! TCP connection. Peer discovery needs a broadcast domain, so these
//! tests talk to the TCP side directly.
use std::fs;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lanchat::engine::{Engine, EngineConfig, EngineEvent};
use lanchat::stager;
use lanchat::throttle::Throttler;
use lanchat::transfer::{self, ReceivePlan};
use lanchat::transport::{self, FrameRead};
use lanchat::SessionCrypto;

#[test]
fn framed_send_data_roundtrip() {
    let _ = env_logger::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        match transport::read_frame(&mut stream).unwrap() {
            FrameRead::Frame(payload) => payload,
            FrameRead::Eof => panic!("expected a frame"),
        }
    });

    assert!(transport::send_data(addr.ip(), addr.port(), b"hello frame"));
    assert_eq!(handle.join().unwrap(), b"hello frame");
}

#[test]
fn bind_in_range_picks_next_free_port() {
    let (first, first_port) = transport::bind_in_range("127.0.0.1", 51234, 51240).unwrap();
    let (_second, second_port) = transport::bind_in_range("127.0.0.1", 51234, 51240).unwrap();
    assert_eq!(first_port, 51234);
    assert_eq!(second_port, 51235);
    drop(first);
}

fn make_input(dir: &std::path::Path, size: usize) -> std::path::PathBuf {
    let input = dir.join("input.bin");
    let mut data = vec![0u8; size];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    fs::write(&input, &data).unwrap();
    input
}

#[test]
fn encrypted_file_stream_loopback() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let input = make_input(dir.path(), 1024 * 1024);
    let expected_sha = stager::sha256_file(&input).unwrap();
    let expected_size = fs::metadata(&input).unwrap().len();

    let crypto = Arc::new(SessionCrypto::new("loopback-pw", "R"));
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let save_path = dir.path().join("recv.part");

    let recv_crypto = Arc::clone(&crypto);
    let recv_save = save_path.clone();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let header = match transport::read_frame(&mut stream).unwrap() {
            FrameRead::Frame(payload) => payload,
            FrameRead::Eof => panic!("expected stream header"),
        };
        let plain = recv_crypto.decrypt(&header).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&plain).unwrap();
        assert_eq!(value["type"], "FILE_STREAM_START");
        assert_eq!(value["req_id"], "req-loopback");
        let plan = ReceivePlan {
            req_id: "req-loopback".to_string(),
            save_path: recv_save,
            is_zip: false,
            expected_size: value["expected_size"].as_u64().unwrap(),
            expected_sha256: value["expected_sha256"].as_str().unwrap().to_string(),
        };
        transfer::receive_stream(&mut stream, &plan, &recv_crypto)
    });

    let mut throttler = Throttler::new(0);
    let ok = transport::send_file_stream(
        addr.ip(),
        addr.port(),
        &input,
        "req-loopback",
        &crypto,
        &mut throttler,
        expected_size,
        &expected_sha,
    );
    assert!(ok);

    let final_path = handle.join().unwrap().unwrap();
    assert_eq!(final_path, save_path);
    assert_eq!(fs::read(&final_path).unwrap(), fs::read(&input).unwrap());
    assert_eq!(stager::sha256_file(&final_path).unwrap(), expected_sha);
}

#[test]
fn corrupted_stream_leaves_no_partial_file() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let input = make_input(dir.path(), 64 * 1024);
    let expected_size = fs::metadata(&input).unwrap().len();

    let crypto = Arc::new(SessionCrypto::new("loopback-pw", "R"));
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let save_path = dir.path().join("recv.part");

    let recv_crypto = Arc::clone(&crypto);
    let recv_save = save_path.clone();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _header = transport::read_frame(&mut stream).unwrap();
        let plan = ReceivePlan {
            req_id: "req-bad".to_string(),
            save_path: recv_save,
            is_zip: false,
            expected_size,
            // Digest the sender can never match.
            expected_sha256: "00".repeat(32),
        };
        transfer::receive_stream(&mut stream, &plan, &recv_crypto)
    });

    let mut throttler = Throttler::new(0);
    let ok = transport::send_file_stream(
        addr.ip(),
        addr.port(),
        &input,
        "req-bad",
        &crypto,
        &mut throttler,
        expected_size,
        &"00".repeat(32),
    );
    assert!(ok);

    let result = handle.join().unwrap();
    assert!(result.is_err());
    assert!(!save_path.exists());
}

fn test_engine(password: &str, room: &str) -> (Engine, crossbeam_channel::Receiver<EngineEvent>) {
    // Ephemeral discovery port keeps concurrent tests deaf to each other.
    let config = EngineConfig {
        nickname: "Tester".to_string(),
        password: password.to_string(),
        room_name: room.to_string(),
        discovery_port: 0,
        ..EngineConfig::default()
    };
    let (engine, events) = Engine::new(config).unwrap();
    engine.start();
    (engine, events)
}

fn chat_message_json(msg_id: &str, content: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "type": "MESSAGE",
        "msg_id": msg_id,
        "sender_session": "aaaa1111",
        "sender_nickname": "Alice",
        "sender_short_id": "000.121",
        "content": content,
        "timestamp": 1_700_000_000.0,
        "vclock": { "aaaa1111": 1 }
    }))
    .unwrap()
}

#[test]
fn engine_delivers_message_once() {
    let _ = env_logger::try_init();
    let (engine, events) = test_engine("", "R");
    let ip = "127.0.0.1".parse().unwrap();
    let frame = chat_message_json("aaaa1111_1", "hi");

    assert!(transport::send_data(ip, engine.tcp_port(), &frame));
    match events.recv_timeout(Duration::from_secs(5)).unwrap() {
        EngineEvent::MessageReceived(msg) => {
            assert_eq!(msg.content, "hi");
            assert_eq!(msg.msg_id, "aaaa1111_1");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Replay: the duplicate must not surface again.
    assert!(transport::send_data(ip, engine.tcp_port(), &frame));
    assert!(matches!(
        events.recv_timeout(Duration::from_secs(1)),
        Err(crossbeam_channel::RecvTimeoutError::Timeout)
    ));
    assert_eq!(engine.get_history_snapshot().len(), 1);
    engine.stop();
}

#[test]
fn encrypted_engine_drops_plaintext_frames() {
    let _ = env_logger::try_init();
    let (engine, events) = test_engine("room-pw", "Sealed");
    let ip = "127.0.0.1".parse().unwrap();

    // Plaintext from a peer without the room key: dropped, no event.
    let frame = chat_message_json("aaaa1111_1", "sneak");
    assert!(transport::send_data(ip, engine.tcp_port(), &frame));
    assert!(matches!(
        events.recv_timeout(Duration::from_secs(1)),
        Err(crossbeam_channel::RecvTimeoutError::Timeout)
    ));
    assert!(engine.get_history_snapshot().is_empty());

    // The same packet under the room key goes through.
    let crypto = SessionCrypto::new("room-pw", "Sealed");
    let enc = crypto.encrypt(&chat_message_json("aaaa1111_2", "hello")).unwrap();
    assert!(transport::send_data(ip, engine.tcp_port(), &enc));
    match events.recv_timeout(Duration::from_secs(5)).unwrap() {
        EngineEvent::MessageReceived(msg) => assert_eq!(msg.content, "hello"),
        other => panic!("unexpected event: {other:?}"),
    }
    engine.stop();
}
