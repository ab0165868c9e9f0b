//! Top-level orchestrator. Owns discovery, the history log, the session
//! cipher and the transfer tables; runs the TCP accept loop, the packet
//! demultiplexer and the peer-monitor loop; surfaces everything to the
//! front-end as events on an unbounded channel so no worker ever blocks
//! on a slow consumer.
use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{error, info, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::crypto::SessionCrypto;
use crate::discovery::{
    Peer, PeerDiscovery, DEFAULT_BROADCAST_INTERVAL, DEFAULT_DISCOVERY_PORT, PEER_TIMEOUT,
};
use crate::history::HistoryLog;
use crate::protocol::{ControlPacket, Message, MessageExtra, MessageKind, LOBBY_ROOM};
use crate::stager::{self, TransferSource};
use crate::throttle::Throttler;
use crate::transfer::{self, OutgoingTransfer, ReceivePlan, TransferTables};
use crate::transport;

const MONITOR_INTERVAL: Duration = Duration::from_secs(2);
const CONTROL_READ_TIMEOUT: Duration = Duration::from_secs(10);
const TCP_PORT_START: u16 = 50001;
const TCP_PORT_END: u16 = 50100;

/// Events delivered to the front-end. Dispatch is non-blocking; the
/// consumer marshals to its own thread as needed.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    PeerUpdated(std::collections::HashMap<String, Peer>),
    MessageReceived(Message),
    ChatHistoryReceived(Vec<Message>),
    FileTransferCompleted { req_id: String, final_path: PathBuf },
}

/// Engine configuration, passed by value at construction. There is no
/// process-wide config; persistence belongs to the front-end.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub nickname: String,
    pub password: String,
    pub room_name: String,
    pub discovery_port: u16,
    pub broadcast_interval: Duration,
    /// Where staging archives for multi-file shares are written.
    pub staging_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            nickname: "Anonymous".to_string(),
            password: String::new(),
            room_name: "Lobby".to_string(),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
            staging_dir: PathBuf::from("."),
        }
    }
}

/// Cheaply cloneable handle shared by all worker threads. A room change
/// is a new Engine: the room key is derived from the room name, so
/// swapping rooms means swapping the whole crypto context.
#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    crypto: Arc<SessionCrypto>,
    discovery: Arc<PeerDiscovery>,
    history: Arc<HistoryLog>,
    transfers: Arc<TransferTables>,
    listener: Arc<TcpListener>,
    tcp_port: u16,
    events: Sender<EngineEvent>,
    running: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<(Self, Receiver<EngineEvent>)> {
        let crypto = Arc::new(SessionCrypto::new(&config.password, &config.room_name));
        let (listener, tcp_port) =
            transport::bind_in_range("0.0.0.0", TCP_PORT_START, TCP_PORT_END)?;
        info!("[Engine] TCP bound (port {tcp_port})");
        let discovery = Arc::new(PeerDiscovery::new(
            &config.nickname,
            tcp_port,
            &config.room_name,
            crypto.is_encrypted(),
            config.discovery_port,
            config.broadcast_interval,
        )?);
        let history = Arc::new(HistoryLog::new(discovery.session_id()));
        let (events, event_rx) = unbounded();
        let engine = Self {
            config: Arc::new(config),
            crypto,
            discovery,
            history,
            transfers: Arc::new(TransferTables::default()),
            listener: Arc::new(listener),
            tcp_port,
            events,
            running: Arc::new(AtomicBool::new(false)),
        };
        Ok((engine, event_rx))
    }

    pub fn session_id(&self) -> &str {
        self.discovery.session_id()
    }

    pub fn local_ip(&self) -> IpAddr {
        self.discovery.local_ip()
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn nickname(&self) -> &str {
        &self.config.nickname
    }

    pub fn room_name(&self) -> &str {
        &self.config.room_name
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypto.is_encrypted()
    }

    pub fn short_id(&self) -> String {
        PeerDiscovery::ip_short_id(self.local_ip())
    }

    pub fn get_active_peers(&self) -> std::collections::HashMap<String, Peer> {
        self.discovery.get_active_peers(PEER_TIMEOUT)
    }

    pub fn get_history_snapshot(&self) -> Vec<Message> {
        self.history.get_history_snapshot()
    }

    /// Launch the accept loop, discovery and the peer monitor. Non-blocking.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        let _ = self.listener.set_nonblocking(true);
        self.discovery.start();
        let acceptor = self.clone();
        thread::spawn(move || acceptor.accept_loop());
        let monitor = self.clone();
        thread::spawn(move || monitor.peer_monitor_loop());
        info!(
            "[Engine] started (nick={}, tcp={}, encrypted={})",
            self.config.nickname, self.tcp_port, self.is_encrypted()
        );
    }

    /// Withdraw outstanding offers, stop the workers and sweep temp files.
    pub fn stop(&self) {
        for req_id in self.transfers.outgoing_ids() {
            self.cancel_file_sharing(&req_id);
        }

        self.running.store(false, Ordering::SeqCst);
        self.discovery.stop();

        // Staged archives that survived the cancel pass.
        for (req_id, info) in self.transfers.outgoing_snapshot() {
            if info.is_zip && info.path.exists() {
                if let Err(e) = fs::remove_file(&info.path) {
                    warn!("[Engine] temp cleanup failed ({req_id}): {e}");
                }
            }
        }

        // Receiver-side partials, then their directories if now empty.
        let mut temp_dirs = HashSet::new();
        for (req_id, part_path) in self.transfers.download_snapshot() {
            let is_part = part_path
                .extension()
                .map_or(false, |ext| ext == "part");
            if is_part && part_path.exists() {
                match fs::remove_file(&part_path) {
                    Ok(()) => {
                        info!("[Engine] cleaned up .part file ({req_id}): {}", part_path.display());
                        if let Some(parent) = part_path.parent() {
                            temp_dirs.insert(parent.to_path_buf());
                        }
                    }
                    Err(e) => warn!("[Engine] .part cleanup failed ({req_id}): {e}"),
                }
            }
        }
        for dir in temp_dirs {
            // Succeeds only when the sweep emptied the directory.
            let _ = fs::remove_dir(&dir);
        }
        info!("[Engine] stopped");
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    // ---- outbound API ----------------------------------------------------

    /// Serialize, encrypt and send a gossip packet to every active peer in
    /// this room. Returns the delivery count; failures are logged only.
    fn broadcast_to_room(&self, packet: &Message) -> usize {
        let enc = match self.encrypt_json(packet) {
            Some(enc) => enc,
            None => return 0,
        };
        let mut delivered = 0;
        for peer in self.get_active_peers().values() {
            if peer.room_name == self.config.room_name
                && transport::send_data(peer.ip, peer.tcp_port, &enc)
            {
                delivered += 1;
            }
        }
        delivered
    }

    fn encrypt_json<T: serde::Serialize>(&self, packet: &T) -> Option<Vec<u8>> {
        let raw = match serde_json::to_vec(packet) {
            Ok(raw) => raw,
            Err(e) => {
                error!("[Engine] packet serialize failed: {e}");
                return None;
            }
        };
        match self.crypto.encrypt(&raw) {
            Ok(enc) => Some(enc),
            Err(e) => {
                error!("[Engine] packet encrypt failed: {e}");
                None
            }
        }
    }

    pub fn broadcast_chat_message(&self, message: &str) -> bool {
        let packet = self.history.add_local_message(
            MessageKind::Message,
            &self.config.nickname,
            &self.short_id(),
            message,
            MessageExtra::default(),
        );
        self.broadcast_to_room(&packet) > 0
    }

    /// Direct message to one peer; still logged and clock-tagged.
    pub fn send_chat_message(&self, target_session_id: &str, message: &str) -> bool {
        let peers = self.get_active_peers();
        let Some(target) = peers.get(target_session_id) else {
            warn!("[Engine] peer not found: {target_session_id}");
            return false;
        };
        let packet = self.history.add_local_message(
            MessageKind::Message,
            &self.config.nickname,
            &self.short_id(),
            message,
            MessageExtra::default(),
        );
        match self.encrypt_json(&packet) {
            Some(enc) => transport::send_data(target.ip, target.tcp_port, &enc),
            None => false,
        }
    }

    /// Offer files to the room. Returns (delivered-to-anyone, source, req_id);
    /// the offer stays open until canceled regardless of delivery.
    pub fn broadcast_file_request(
        &self,
        paths: &[PathBuf],
        speed_limit_bytes: i64,
    ) -> Result<(bool, TransferSource, String)> {
        let req_id = Uuid::new_v4().to_string();
        let staging_path = self.config.staging_dir.join(format!("temp_{req_id}.zip"));
        let source = stager::prepare_transfer(paths, &staging_path)?;
        let file_sha256 = stager::sha256_file(&source.path)?;

        self.transfers.insert_outgoing(
            &req_id,
            OutgoingTransfer {
                path: source.path.clone(),
                is_zip: source.is_zip,
                speed_limit: speed_limit_bytes,
                file_size: source.size,
                file_sha256: file_sha256.clone(),
            },
        );

        let packet = self.history.add_local_message(
            MessageKind::FileReq,
            &self.config.nickname,
            &self.short_id(),
            &format!("File share: {}", source.name),
            MessageExtra {
                req_id: Some(req_id.clone()),
                file_name: Some(source.name.clone()),
                file_size: Some(source.size),
                is_zip: Some(source.is_zip),
                file_sha256: Some(file_sha256),
                ..Default::default()
            },
        );
        let delivered = self.broadcast_to_room(&packet) > 0;
        Ok((delivered, source, req_id))
    }

    /// Withdraw an offer and tell the room. The staged archive (if any)
    /// is deleted; the original user file never is.
    pub fn cancel_file_sharing(&self, req_id: &str) {
        if let Some(info) = self.transfers.remove_outgoing(req_id) {
            if info.is_zip && info.path.exists() {
                if let Err(e) = fs::remove_file(&info.path) {
                    warn!("[Engine] cancel cleanup failed ({req_id}): {e}");
                }
            }
        }
        let packet = self.history.add_local_message(
            MessageKind::FileCancel,
            &self.config.nickname,
            &self.short_id(),
            "File sharing canceled.",
            MessageExtra {
                req_id: Some(req_id.to_string()),
                ..Default::default()
            },
        );
        self.broadcast_to_room(&packet);
    }

    /// Accept an incoming offer: record the save path, then signal the
    /// offerer so it opens the stream connection back to us.
    pub fn accept_file_transfer(&self, req_id: &str, save_path: &Path) -> bool {
        let Some(request) = self.transfers.incoming_request(req_id) else {
            return false;
        };
        let peers = self.get_active_peers();
        let Some(target) = peers.get(&request.sender_session) else {
            return false;
        };
        self.transfers.mark_accepted(req_id, save_path);
        let packet = ControlPacket::FileAccept {
            req_id: req_id.to_string(),
            sender_session: self.session_id().to_string(),
        };
        match self.encrypt_json(&packet) {
            Some(enc) => transport::send_data(target.ip, target.tcp_port, &enc),
            None => false,
        }
    }

    pub fn reject_file_transfer(&self, req_id: &str) {
        self.transfers.remove_incoming(req_id);
    }

    // ---- worker loops ----------------------------------------------------

    fn accept_loop(&self) {
        loop {
            if !self.running.load(Ordering::Relaxed) {
                break;
            }
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let engine = self.clone();
                    thread::spawn(move || engine.handle_connection(stream, addr));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    if self.running.load(Ordering::Relaxed) {
                        warn!("[Engine] accept error: {e}");
                    }
                    thread::sleep(Duration::from_millis(200));
                }
            }
        }
    }

    /// Watch the peer set; on any change push history to room newcomers
    /// (never in the lobby) and notify the front-end.
    fn peer_monitor_loop(&self) {
        let mut last_keys: HashSet<String> = HashSet::new();
        while self.running.load(Ordering::Relaxed) {
            let peers = self.get_active_peers();
            let keys: HashSet<String> = peers.keys().cloned().collect();
            if keys != last_keys {
                if self.config.room_name != LOBBY_ROOM {
                    for sid in keys.difference(&last_keys) {
                        let Some(peer) = peers.get(sid) else { continue };
                        if peer.room_name == self.config.room_name {
                            let engine = self.clone();
                            let (ip, port) = (peer.ip, peer.tcp_port);
                            thread::spawn(move || engine.send_chat_history_to(ip, port));
                        }
                    }
                }
                self.emit(EngineEvent::PeerUpdated(peers));
                last_keys = keys;
            }
            thread::sleep(MONITOR_INTERVAL);
        }
    }

    fn send_chat_history_to(&self, ip: IpAddr, port: u16) {
        let messages = self.history.get_history_snapshot();
        if messages.is_empty() {
            return;
        }
        let count = messages.len();
        let packet = ControlPacket::ChatHistory { messages };
        if let Some(enc) = self.encrypt_json(&packet) {
            transport::send_data(ip, port, &enc);
            info!("[Engine] sent chat history ({count}) -> {ip}:{port}");
        }
    }

    // ---- inbound demux ---------------------------------------------------

    fn handle_connection(&self, mut stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = self.serve_connection(&mut stream, addr) {
            warn!("[Engine] TCP handler error ({addr}): {e}");
        }
        // Socket closes on drop, on every exit path.
    }

    fn serve_connection(&self, stream: &mut TcpStream, addr: SocketAddr) -> Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(CONTROL_READ_TIMEOUT))?;

        let payload = match transport::read_frame(stream)? {
            transport::FrameRead::Frame(payload) => payload,
            transport::FrameRead::Eof => return Ok(()),
        };
        let plain = self.crypto.decrypt(&payload)?;
        let value: Value = serde_json::from_slice(&plain)?;
        let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_owned) else {
            anyhow::bail!("packet missing type discriminator");
        };

        match kind.as_str() {
            "MESSAGE" | "FILE_REQ" | "FILE_CANCEL" | "FILE_DOWNLOADED" => {
                self.handle_gossip(serde_json::from_value(value)?);
            }
            "CHAT_HISTORY" | "FILE_ACCEPT" | "FILE_STREAM_START" => {
                match serde_json::from_value::<ControlPacket>(value)? {
                    ControlPacket::ChatHistory { messages } => self.handle_chat_history(messages),
                    ControlPacket::FileAccept {
                        req_id,
                        sender_session,
                    } => self.handle_file_accept(&req_id, &sender_session),
                    ControlPacket::FileStreamStart {
                        req_id,
                        expected_size,
                        expected_sha256,
                    } => {
                        self.handle_stream_start(stream, addr, &req_id, expected_size, &expected_sha256)?;
                    }
                }
            }
            other => warn!("[Engine] unknown packet type {other:?} from {addr}"),
        }
        Ok(())
    }

    /// Dedup gate first: a replayed packet causes no callback, no table
    /// change and no duplicate prompt.
    fn handle_gossip(&self, msg: Message) {
        if !self.history.receive_remote_message(&msg) {
            return;
        }
        match msg.kind {
            MessageKind::FileReq => self.transfers.register_incoming(&msg),
            MessageKind::FileCancel => {
                // Withdrawn offer: drop it before the user can accept.
                if let Some(req_id) = &msg.req_id {
                    self.transfers.remove_incoming(req_id);
                }
            }
            _ => {}
        }
        self.emit(EngineEvent::MessageReceived(msg));
    }

    fn handle_chat_history(&self, messages: Vec<Message>) {
        let total = messages.len();
        let mut new_messages = Vec::new();
        for msg in messages {
            if self.history.receive_remote_message(&msg) {
                new_messages.push(msg);
            }
        }
        info!(
            "[Engine] chat history received: total={total}, new={}",
            new_messages.len()
        );
        if !new_messages.is_empty() {
            self.emit(EngineEvent::ChatHistoryReceived(new_messages));
        }
    }

    /// A receiver accepted our offer: stream the file to it from a fresh
    /// connection, one worker per acceptance.
    fn handle_file_accept(&self, req_id: &str, sender_session: &str) {
        let Some(out_info) = self.transfers.outgoing(req_id) else {
            return;
        };
        let peers = self.get_active_peers();
        let Some(target) = peers.get(sender_session) else {
            warn!("[Engine] file accept peer not found: {sender_session}");
            return;
        };
        let engine = self.clone();
        let req_id = req_id.to_string();
        let sender_session = sender_session.to_string();
        let (target_ip, target_port) = (target.ip, target.tcp_port);
        thread::spawn(move || {
            engine.run_send_task(&req_id, &sender_session, out_info, target_ip, target_port)
        });
    }

    fn run_send_task(
        &self,
        req_id: &str,
        sender_session: &str,
        out_info: OutgoingTransfer,
        target_ip: IpAddr,
        target_port: u16,
    ) {
        let mut throttler = Throttler::new(out_info.speed_limit);
        let ok = transport::send_file_stream(
            target_ip,
            target_port,
            &out_info.path,
            req_id,
            &self.crypto,
            &mut throttler,
            out_info.file_size,
            &out_info.file_sha256,
        );
        if !ok {
            return;
        }
        let peers = self.get_active_peers();
        let downloader_nickname = peers
            .get(sender_session)
            .map(|p| p.nickname.clone())
            .unwrap_or_else(|| "Unknown".to_string());
        let packet = self.history.add_local_message(
            MessageKind::FileDownloaded,
            &self.config.nickname,
            &self.short_id(),
            &format!("Downloaded: {req_id}"),
            MessageExtra {
                req_id: Some(req_id.to_string()),
                downloader_nickname: Some(downloader_nickname),
                downloader_short_id: Some(PeerDiscovery::ip_short_id(target_ip)),
                ..Default::default()
            },
        );
        self.broadcast_to_room(&packet);
        self.emit(EngineEvent::MessageReceived(packet));
    }

    /// Inbound file stream. Only streams for offers we accepted, and only
    /// from the address the offer came from; anything else is dropped
    /// without touching disk.
    fn handle_stream_start(
        &self,
        stream: &mut TcpStream,
        addr: SocketAddr,
        req_id: &str,
        expected_size: u64,
        expected_sha256: &str,
    ) -> Result<()> {
        // Streaming can far outlive the control-frame timeout.
        stream.set_read_timeout(None)?;

        let (Some(save_path), Some(request)) = (
            self.transfers.download_path(req_id),
            self.transfers.incoming_request(req_id),
        ) else {
            warn!("[Engine] rejected FILE_STREAM_START (not accepted): {req_id}");
            return Ok(());
        };

        let peers = self.get_active_peers();
        let sender_ok = peers
            .get(&request.sender_session)
            .map_or(false, |peer| peer.ip == addr.ip());
        if !sender_ok {
            warn!("[Engine] rejected FILE_STREAM_START (sender mismatch): {req_id}");
            return Ok(());
        }

        let plan = ReceivePlan {
            req_id: req_id.to_string(),
            save_path,
            is_zip: request.is_zip.unwrap_or(false),
            // Prefer what the offer declared; the stream header is a fallback.
            expected_size: request.file_size.unwrap_or(expected_size),
            expected_sha256: request
                .file_sha256
                .clone()
                .unwrap_or_else(|| expected_sha256.to_string())
                .to_lowercase(),
        };
        let result = transfer::receive_stream(stream, &plan, &self.crypto);
        self.transfers.remove_download_path(req_id);
        match result {
            Ok(final_path) => {
                info!("[Engine] file receive completed: {}", final_path.display());
                self.emit(EngineEvent::FileTransferCompleted {
                    req_id: req_id.to_string(),
                    final_path,
                });
            }
            Err(e) => warn!("[Engine] file stream validation failed ({req_id}): {e}"),
        }
        Ok(())
    }
}
