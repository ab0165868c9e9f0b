//! Line-oriented terminal front-end. Everything interesting lives in the
//! engine; this binary just wires stdin to the API and the event channel
//! to stdout.
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::thread;

use anyhow::Result;
use lanchat::{Engine, EngineConfig, EngineEvent, MessageKind};

fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let nickname = args.next().unwrap_or_else(|| "Anonymous".to_string());
    let room_name = args.next().unwrap_or_else(|| "Lobby".to_string());
    let password = args.next().unwrap_or_default();

    let config = EngineConfig {
        nickname,
        password,
        room_name,
        ..EngineConfig::default()
    };
    let (engine, events) = Engine::new(config)?;
    engine.start();
    println!(
        "joined {} as {} ({}), tcp port {}",
        engine.room_name(),
        engine.nickname(),
        engine.session_id(),
        engine.tcp_port()
    );
    println!("commands: /peers /share <path>.. /accept <req> <save> /reject <req> /cancel <req> /quit");

    thread::spawn(move || {
        for event in events {
            match event {
                EngineEvent::PeerUpdated(peers) => {
                    println!("* {} peer(s) online", peers.len());
                }
                EngineEvent::MessageReceived(msg) => match msg.kind {
                    MessageKind::Message => {
                        println!("<{} {}> {}", msg.sender_nickname, msg.sender_short_id, msg.content)
                    }
                    MessageKind::FileReq => println!(
                        "* {} offers {} ({} bytes), req={}",
                        msg.sender_nickname,
                        msg.file_name.as_deref().unwrap_or("?"),
                        msg.file_size.unwrap_or(0),
                        msg.req_id.as_deref().unwrap_or("?")
                    ),
                    MessageKind::FileCancel => println!(
                        "* {} withdrew offer {}",
                        msg.sender_nickname,
                        msg.req_id.as_deref().unwrap_or("?")
                    ),
                    MessageKind::FileDownloaded => println!(
                        "* {} downloaded {}",
                        msg.downloader_nickname.as_deref().unwrap_or("?"),
                        msg.req_id.as_deref().unwrap_or("?")
                    ),
                },
                EngineEvent::ChatHistoryReceived(batch) => {
                    println!("* history sync: {} message(s)", batch.len());
                    for msg in batch {
                        println!("  <{}> {}", msg.sender_nickname, msg.content);
                    }
                }
                EngineEvent::FileTransferCompleted { req_id, final_path } => {
                    println!("* transfer {} completed: {}", req_id, final_path.display());
                }
            }
        }
    });

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("/quit") => break,
            Some("/peers") => {
                for (sid, peer) in engine.get_active_peers() {
                    println!("  {} {} @ {} room={}", sid, peer.nickname, peer.ip, peer.room_name);
                }
            }
            Some("/share") => {
                let paths: Vec<PathBuf> = parts.map(PathBuf::from).collect();
                match engine.broadcast_file_request(&paths, 0) {
                    Ok((delivered, source, req_id)) => println!(
                        "offered {} ({} bytes) req={} delivered={}",
                        source.name, source.size, req_id, delivered
                    ),
                    Err(e) => println!("share failed: {e}"),
                }
            }
            Some("/accept") => {
                if let (Some(req_id), Some(save)) = (parts.next(), parts.next()) {
                    let ok = engine.accept_file_transfer(req_id, &PathBuf::from(save));
                    println!("accept {}: {}", req_id, if ok { "ok" } else { "failed" });
                }
            }
            Some("/reject") => {
                if let Some(req_id) = parts.next() {
                    engine.reject_file_transfer(req_id);
                }
            }
            Some("/cancel") => {
                if let Some(req_id) = parts.next() {
                    engine.cancel_file_sharing(req_id);
                }
            }
            _ => {
                if !engine.broadcast_chat_message(line) {
                    println!("(no active peers in this room)");
                }
            }
        }
        io::stdout().flush().ok();
    }

    engine.stop();
    Ok(())
}
