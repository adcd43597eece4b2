use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use uuid::Uuid;

use super::frame::{decode, Decoded, Frame, DEFAULT_MAX_FRAME_SIZE};
use super::tls::{self, TlsConfig, TlsStream};
use super::{AckMode, Connection, ConnectionListener, Credentials, ListenerSet};
use crate::domain::errors::TransportError;
use crate::domain::records::Headers;

/// How long a single blocking read may wait before the I/O loop gets to
/// flush outgoing frames and heart-beats.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub hosts: Vec<(String, u16)>,
    pub vhost: String,
    /// Heart-beat intervals in milliseconds: (we send every, we want every).
    pub heartbeats: (u64, u64),
    pub tls: Option<TlsConfig>,
    pub connect_timeout: Duration,
    pub receipt_timeout: Duration,
    /// Frames from the broker larger than this many bytes end the session.
    pub max_frame_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            hosts: vec![("127.0.0.1".to_string(), 61613)],
            vhost: "/".to_string(),
            heartbeats: (10_000, 10_000),
            tls: None,
            connect_timeout: Duration::from_secs(10),
            receipt_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream>),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
        }
    }
}

impl Transport {
    fn shutdown(&self) {
        let tcp = match self {
            Transport::Plain(s) => s,
            Transport::Tls(s) => s.get_ref(),
        };
        let _ = tcp.shutdown(std::net::Shutdown::Both);
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// State shared between the public handle and one session's I/O thread.
struct Shared {
    outbound: Mutex<Sender<Frame>>,
    connected: AtomicBool,
    closing: AtomicBool,
    receipts: Mutex<HashMap<String, Sender<()>>>,
    io_thread: Mutex<Option<ThreadId>>,
}

impl Shared {
    fn enqueue(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let outbound = self
            .outbound
            .lock()
            .map_err(|_| TransportError::NotConnected)?;
        outbound.send(frame).map_err(|_| TransportError::NotConnected)
    }

    fn expect_receipt(&self, id: &str) -> Receiver<()> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut receipts) = self.receipts.lock() {
            receipts.insert(id.to_string(), tx);
        }
        rx
    }

    fn forget_receipt(&self, id: &str) {
        if let Ok(mut receipts) = self.receipts.lock() {
            receipts.remove(id);
        }
    }
}

struct Session {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

/// Blocking STOMP 1.2 client.
///
/// Each successful `connect` starts an I/O thread that owns the socket. It
/// writes queued frames, exchanges heart-beats, and invokes the registered
/// listeners for every frame it reads, so a slow `on_message` delays
/// heart-beats for as long as it runs.
pub struct StompConnection {
    config: BrokerConfig,
    listeners: Arc<ListenerSet>,
    session: Mutex<Option<Session>>,
    connecting: Mutex<()>,
}

impl StompConnection {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            listeners: Arc::new(ListenerSet::default()),
            session: Mutex::new(None),
            connecting: Mutex::new(()),
        }
    }

    fn shared(&self) -> Result<Arc<Shared>, TransportError> {
        let session = self
            .session
            .lock()
            .map_err(|_| TransportError::NotConnected)?;
        session
            .as_ref()
            .map(|s| Arc::clone(&s.shared))
            .ok_or(TransportError::NotConnected)
    }

    fn open(&self, host: &str, port: u16) -> Result<Transport, TransportError> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransportError::Protocol(format!("cannot resolve {}:{}", host, port)))?;
        let tcp = TcpStream::connect_timeout(&addr, self.config.connect_timeout)?;
        tcp.set_nodelay(true)?;
        match &self.config.tls {
            Some(tls_config) => {
                let client = tls_config.client_config()?;
                Ok(Transport::Tls(Box::new(tls::wrap(client, host, tcp)?)))
            }
            None => Ok(Transport::Plain(tcp)),
        }
    }

    fn set_read_timeout(transport: &Transport, timeout: Duration) -> io::Result<()> {
        match transport {
            Transport::Plain(s) => s.set_read_timeout(Some(timeout)),
            Transport::Tls(s) => s.get_ref().set_read_timeout(Some(timeout)),
        }
    }

    /// Run the CONNECT handshake on one host. Returns the live transport, the
    /// CONNECTED frame and any bytes read past it.
    fn handshake(
        &self,
        host: &str,
        port: u16,
        credentials: &Credentials,
    ) -> Result<(Transport, Frame, Vec<u8>), TransportError> {
        let mut transport = self.open(host, port)?;
        let (cx, cy) = self.config.heartbeats;
        let connect = Frame::new("CONNECT")
            .with_header("accept-version", "1.2")
            .with_header("host", self.config.vhost.clone())
            .with_header("login", credentials.username.clone())
            .with_header("passcode", credentials.passcode.clone())
            .with_header("heart-beat", format!("{},{}", cx, cy));
        transport.write_all(&connect.encode())?;
        transport.flush()?;

        Self::set_read_timeout(&transport, POLL_INTERVAL)?;
        let deadline = Instant::now() + self.config.connect_timeout;
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            while let Some((item, used)) = decode(&buffer, self.config.max_frame_size)? {
                buffer.drain(..used);
                if let Decoded::Frame(frame) = item {
                    return match frame.command.as_str() {
                        "CONNECTED" => Ok((transport, frame, buffer)),
                        "ERROR" => Err(TransportError::Broker(
                            frame.header("message").unwrap_or("connection refused").to_string(),
                        )),
                        other => Err(TransportError::Protocol(format!(
                            "unexpected {} frame during handshake",
                            other
                        ))),
                    };
                }
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Protocol(
                    "no CONNECTED frame before the connect timeout".to_string(),
                ));
            }
            match transport.read(&mut chunk) {
                Ok(0) => {
                    return Err(TransportError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "broker closed the connection during handshake",
                    )))
                }
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(e) if is_timeout(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Negotiated (send, receive) heart-beat intervals; zero disables.
    fn negotiate(ours: (u64, u64), theirs: Option<&str>) -> (Duration, Duration) {
        let (sx, sy) = theirs
            .and_then(|v| v.split_once(','))
            .and_then(|(a, b)| Some((a.trim().parse::<u64>().ok()?, b.trim().parse::<u64>().ok()?)))
            .unwrap_or((0, 0));
        let (cx, cy) = ours;
        let send = if cx == 0 || sy == 0 { 0 } else { cx.max(sy) };
        let recv = if cy == 0 || sx == 0 { 0 } else { cy.max(sx) };
        (Duration::from_millis(send), Duration::from_millis(recv))
    }

    fn start_session(
        &self,
        transport: Transport,
        leftover: Vec<u8>,
        heartbeats: (Duration, Duration),
    ) -> Session {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            outbound: Mutex::new(tx),
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            receipts: Mutex::new(HashMap::new()),
            io_thread: Mutex::new(None),
        });
        let io = IoLoop {
            transport,
            buffer: leftover,
            outbound: rx,
            shared: Arc::clone(&shared),
            listeners: Arc::clone(&self.listeners),
            max_frame_size: self.config.max_frame_size,
            send_every: heartbeats.0,
            expect_every: heartbeats.1,
            last_write: Instant::now(),
            last_read: Instant::now(),
        };
        let handle = thread::Builder::new()
            .name("stomp-io".to_string())
            .spawn(move || io.run())
            .ok();
        if let (Some(h), Ok(mut id)) = (&handle, shared.io_thread.lock()) {
            *id = Some(h.thread().id());
        }
        if handle.is_none() {
            error!("Could not spawn the STOMP I/O thread");
            shared.connected.store(false, Ordering::SeqCst);
        }
        Session { shared, handle }
    }
}

impl Connection for StompConnection {
    fn connect(&self, credentials: &Credentials) -> Result<(), TransportError> {
        let _guard = self
            .connecting
            .lock()
            .map_err(|_| TransportError::Protocol("connect lock poisoned".to_string()))?;
        if self.is_connected() {
            return Ok(());
        }

        let mut last_error = TransportError::NotConnected;
        for (host, port) in &self.config.hosts {
            for listener in self.listeners.snapshot() {
                listener.on_connecting(host, *port);
            }
            match self.handshake(host, *port, credentials) {
                Ok((transport, connected, leftover)) => {
                    let heartbeats =
                        Self::negotiate(self.config.heartbeats, connected.header("heart-beat"));
                    let session = self.start_session(transport, leftover, heartbeats);
                    if let Ok(mut current) = self.session.lock() {
                        *current = Some(session);
                    }
                    info!("Connected to STOMP broker at {}:{}", host, port);
                    for listener in self.listeners.snapshot() {
                        listener.on_connected(&connected);
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!("Could not connect to {}:{}: {}", host, port, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        let session = match self.session.lock() {
            Ok(mut current) => current.take(),
            Err(_) => None,
        };
        let Some(mut session) = session else {
            debug!("Disconnect requested without an open session");
            return Ok(());
        };

        let on_io_thread = session
            .shared
            .io_thread
            .lock()
            .map(|id| *id == Some(thread::current().id()))
            .unwrap_or(false);
        let receipt = Uuid::new_v4().to_string();
        let rx = session.shared.expect_receipt(&receipt);
        let queued = session
            .shared
            .enqueue(Frame::new("DISCONNECT").with_header("receipt", receipt.clone()))
            .is_ok();
        // Nobody else can read the receipt while we hold the I/O thread.
        if on_io_thread {
            session.shared.closing.store(true, Ordering::SeqCst);
            return Ok(());
        }
        if queued && rx.recv_timeout(self.config.receipt_timeout).is_err() {
            debug!("No receipt for DISCONNECT, closing anyway");
        }
        session.shared.closing.store(true, Ordering::SeqCst);

        if let Some(handle) = session.handle.take() {
            // The I/O thread may be busy inside a listener; never wait on it
            // longer than a receipt.
            let deadline = Instant::now() + self.config.receipt_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(POLL_INTERVAL);
            }
            if !handle.is_finished() {
                warn!("STOMP I/O thread still busy, detaching it");
            } else if handle.join().is_err() {
                error!("STOMP I/O thread panicked");
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared()
            .map(|s| s.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn subscribe(
        &self,
        destination: &str,
        id: &str,
        ack: AckMode,
        headers: &Headers,
    ) -> Result<(), TransportError> {
        let frame = Frame::new("SUBSCRIBE")
            .with_header("destination", destination)
            .with_header("id", id)
            .with_header("ack", ack.as_str())
            .with_headers(headers);
        self.shared()?.enqueue(frame)
    }

    fn unsubscribe(&self, id: &str) -> Result<(), TransportError> {
        self.shared()?
            .enqueue(Frame::new("UNSUBSCRIBE").with_header("id", id))
    }

    fn send(
        &self,
        destination: &str,
        body: &str,
        headers: &Headers,
    ) -> Result<(), TransportError> {
        let shared = self.shared()?;
        let receipt = Uuid::new_v4().to_string();
        let frame = Frame::new("SEND")
            .with_header("destination", destination)
            .with_headers(headers)
            .with_header("receipt", receipt.clone())
            .with_body(body.as_bytes().to_vec());

        let rx = shared.expect_receipt(&receipt);
        if let Err(e) = shared.enqueue(frame.clone()) {
            shared.forget_receipt(&receipt);
            return Err(e);
        }
        for listener in self.listeners.snapshot() {
            listener.on_send(&frame);
        }
        match rx.recv_timeout(self.config.receipt_timeout) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => {
                shared.forget_receipt(&receipt);
                Err(TransportError::ReceiptTimeout(receipt))
            }
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::NotConnected),
        }
    }

    fn ack(&self, id: &str) -> Result<(), TransportError> {
        self.shared()?.enqueue(Frame::new("ACK").with_header("id", id))
    }

    fn nack(&self, id: &str, requeue: bool) -> Result<(), TransportError> {
        self.shared()?.enqueue(
            Frame::new("NACK")
                .with_header("id", id)
                .with_header("requeue", requeue.to_string()),
        )
    }

    fn set_listener(&self, name: &str, listener: Arc<dyn ConnectionListener>) {
        self.listeners.insert(name, listener);
    }

    fn remove_listener(&self, name: &str) {
        self.listeners.remove(name);
    }
}

struct IoLoop {
    transport: Transport,
    buffer: Vec<u8>,
    outbound: Receiver<Frame>,
    shared: Arc<Shared>,
    listeners: Arc<ListenerSet>,
    max_frame_size: usize,
    send_every: Duration,
    expect_every: Duration,
    last_write: Instant,
    last_read: Instant,
}

impl IoLoop {
    fn run(mut self) {
        if let Err(e) = Self::set_timeout(&self.transport) {
            warn!("Could not set the STOMP read timeout: {}", e);
        }
        // bytes read past CONNECTED during the handshake
        let outcome = match self.dispatch() {
            Err(e) => Err(e),
            Ok(()) => loop {
                if self.shared.closing.load(Ordering::SeqCst) {
                    break Ok(());
                }
                if let Err(e) = self.pump() {
                    break Err(e);
                }
            },
        };

        self.shared.connected.store(false, Ordering::SeqCst);
        if outcome.is_ok() {
            // a DISCONNECT queued from a listener is still waiting here
            let _ = self.flush_outbound();
        }
        if let Ok(mut receipts) = self.shared.receipts.lock() {
            // Dropping the senders wakes every waiting `send` with an error.
            receipts.clear();
        }
        self.transport.shutdown();
        match outcome {
            Ok(()) => info!("STOMP connection closed"),
            Err(e) => warn!("STOMP connection lost: {}", e),
        }
        for listener in self.listeners.snapshot() {
            listener.on_disconnected();
        }
    }

    fn set_timeout(transport: &Transport) -> io::Result<()> {
        StompConnection::set_read_timeout(transport, POLL_INTERVAL)
    }

    fn pump(&mut self) -> Result<(), TransportError> {
        self.flush_outbound()?;

        if !self.send_every.is_zero() && self.last_write.elapsed() >= self.send_every {
            self.transport.write_all(b"\n")?;
            self.transport.flush()?;
            self.last_write = Instant::now();
        }

        let mut chunk = [0u8; 8192];
        match self.transport.read(&mut chunk) {
            Ok(0) => {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "broker closed the connection",
                )))
            }
            Ok(n) => {
                self.last_read = Instant::now();
                self.buffer.extend_from_slice(&chunk[..n]);
                self.dispatch()?;
            }
            Err(e) if is_timeout(&e) => {}
            Err(e) => return Err(e.into()),
        }

        if !self.expect_every.is_zero() && self.last_read.elapsed() > self.expect_every * 2 {
            return Err(TransportError::Protocol(
                "broker heart-beats stopped".to_string(),
            ));
        }
        Ok(())
    }

    fn flush_outbound(&mut self) -> Result<(), TransportError> {
        let mut wrote = false;
        loop {
            match self.outbound.try_recv() {
                Ok(frame) => {
                    self.transport.write_all(&frame.encode())?;
                    wrote = true;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    return Err(TransportError::NotConnected);
                }
            }
        }
        if wrote {
            self.transport.flush()?;
            self.last_write = Instant::now();
        }
        Ok(())
    }

    fn dispatch(&mut self) -> Result<(), TransportError> {
        while let Some((item, used)) = decode(&self.buffer, self.max_frame_size)? {
            self.buffer.drain(..used);
            let Decoded::Frame(frame) = item else {
                continue;
            };
            match frame.command.as_str() {
                "MESSAGE" => {
                    for listener in self.listeners.snapshot() {
                        listener.on_message(&frame);
                    }
                    // A listener may have queued ACKs; get them out promptly.
                    self.flush_outbound()?;
                }
                "RECEIPT" => {
                    let waiter = frame.header("receipt-id").and_then(|id| {
                        self.shared
                            .receipts
                            .lock()
                            .ok()
                            .and_then(|mut receipts| receipts.remove(id))
                    });
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(());
                    }
                }
                "ERROR" => {
                    error!(
                        "Broker error: {} {}",
                        frame.header("message").unwrap_or(""),
                        frame.body_text()
                    );
                    for listener in self.listeners.snapshot() {
                        listener.on_error(&frame);
                    }
                }
                other => debug!("Ignoring {} frame", other),
            }
        }
        Ok(())
    }
}
