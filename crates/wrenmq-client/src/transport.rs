//! Transport boundary.
//!
//! The engine talks to the network through the [`Transport`] trait alone, so
//! tests can drive it with an in-memory mock and alternative stacks can slot
//! in without touching protocol code. [`TcpTransport`] is the reference
//! implementation over standard sockets, with optional rustls encryption.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, StreamOwned};
use wrenmq_core::packet::{self, Packet};
use wrenmq_core::ProtocolError;

use crate::config::{ProtocolConfig, TlsConfig};
use crate::tls;

/// Invoked by the transport for every decoded packet, and for every frame
/// that failed to decode.
pub type ReceiveCallback = Box<dyn Fn(Result<Packet, ProtocolError>) + Send + Sync>;

/// Whether the connection is wrapped in TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    None,
    Tls,
}

/// Byte-level connection to a broker.
///
/// Implementations own their receive loop: after `connect` succeeds they
/// deliver decoded packets through the callback installed with
/// `set_receive_callback` until `disconnect` tears the connection down.
pub trait Transport: Send + Sync {
    fn connect(&self, host: &str, port: u16, encryption: Encryption) -> io::Result<()>;

    fn write(&self, bytes: &[u8]) -> io::Result<()>;

    /// Install the packet callback. Must be called before `connect`.
    fn set_receive_callback(&self, callback: ReceiveCallback);

    /// Close the connection and block until the receive loop has stopped,
    /// unless called from the receive loop itself.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(stream) => stream.read(buf),
            Stream::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(stream) => stream.write(buf),
            Stream::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(stream) => stream.flush(),
            Stream::Tls(stream) => stream.flush(),
        }
    }
}

struct Conn {
    stream: Stream,
    /// Raw socket handle kept for `shutdown`, which unblocks the reader.
    sock: TcpStream,
}

/// Reference transport over `std::net::TcpStream`, plain or TLS.
///
/// A reader thread waits for inbound bytes on its own handle to the socket,
/// takes the stream lock only to read them, then frames packets out of the
/// byte stream and hands them to the receive callback. Writes never queue
/// behind an idle poll tick.
pub struct TcpTransport {
    tls: TlsConfig,
    max_message_size: usize,
    poll_interval: Duration,
    callback: Arc<RwLock<Option<ReceiveCallback>>>,
    conn: Arc<Mutex<Option<Conn>>>,
    connected: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    pub fn new(config: &ProtocolConfig, tls: TlsConfig) -> Self {
        Self {
            tls,
            max_message_size: config.max_message_size,
            poll_interval: config.receiver_poll_interval,
            callback: Arc::new(RwLock::new(None)),
            conn: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&self, host: &str, port: u16, encryption: Encryption) -> io::Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "transport already connected",
            ));
        }

        let sock = TcpStream::connect((host, port))?;
        sock.set_nodelay(true)?;
        sock.set_read_timeout(Some(self.poll_interval))?;
        let reader_sock = sock.try_clone()?;

        let stream = match encryption {
            Encryption::None => Stream::Plain(sock.try_clone()?),
            Encryption::Tls => {
                let tls_config = tls::build_client_config(&self.tls)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
                let name = self
                    .tls
                    .server_name
                    .clone()
                    .unwrap_or_else(|| host.to_string());
                let server_name = ServerName::try_from(name).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "invalid TLS server name")
                })?;
                let conn = ClientConnection::new(Arc::new(tls_config), server_name)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                Stream::Tls(Box::new(StreamOwned::new(conn, sock.try_clone()?)))
            }
        };

        *self.conn.lock() = Some(Conn { stream, sock });
        self.connected.store(true, Ordering::SeqCst);
        debug!("connected to {}:{}", host, port);

        let conn = Arc::clone(&self.conn);
        let callback = Arc::clone(&self.callback);
        let connected = Arc::clone(&self.connected);
        let max_message_size = self.max_message_size;
        *self.reader.lock() = Some(thread::spawn(move || {
            read_loop(reader_sock, conn, callback, connected, max_message_size);
        }));

        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut guard = self.conn.lock();
        match guard.as_mut() {
            Some(conn) => {
                conn.stream.write_all(bytes)?;
                conn.stream.flush()
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport not connected",
            )),
        }
    }

    fn set_receive_callback(&self, callback: ReceiveCallback) {
        *self.callback.write() = Some(callback);
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(conn) = self.conn.lock().as_ref() {
            let _ = conn.sock.shutdown(Shutdown::Both);
        }
        if let Some(reader) = self.reader.lock().take() {
            // The receive callback may itself call disconnect; joining the
            // current thread would deadlock, and the loop exits on its own
            // once the callback returns.
            if reader.thread().id() != thread::current().id() {
                let _ = reader.join();
            }
        }
        *self.conn.lock() = None;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn read_loop(
    sock: TcpStream,
    conn: Arc<Mutex<Option<Conn>>>,
    callback: Arc<RwLock<Option<ReceiveCallback>>>,
    connected: Arc<AtomicBool>,
    max_message_size: usize,
) {
    let mut acc = BytesMut::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let mut probe = [0u8; 1];
    // Set when the last read filled the chunk; TLS may still hold decoded
    // plaintext that a peek on the raw socket cannot see.
    let mut more = false;

    while connected.load(Ordering::SeqCst) {
        if !more {
            // Wait for inbound bytes on the reader's own handle so the
            // stream lock stays free for writers. The socket read timeout
            // doubles as the poll tick.
            match sock.peek(&mut probe) {
                Ok(0) => {
                    debug!("connection closed by peer");
                    connected.store(false, Ordering::SeqCst);
                    break;
                }
                Ok(_) => {}
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) => {
                    if connected.load(Ordering::SeqCst) {
                        debug!("read error: {}", e);
                        connected.store(false, Ordering::SeqCst);
                    }
                    break;
                }
            }
        }

        let n = {
            let mut guard = conn.lock();
            let Some(conn) = guard.as_mut() else { break };
            match conn.stream.read(&mut chunk) {
                Ok(0) => {
                    debug!("connection closed by peer");
                    connected.store(false, Ordering::SeqCst);
                    break;
                }
                Ok(n) => n,
                // A partial TLS record can leave nothing decodable yet.
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    0
                }
                Err(e) => {
                    if connected.load(Ordering::SeqCst) {
                        debug!("read error: {}", e);
                        connected.store(false, Ordering::SeqCst);
                    }
                    break;
                }
            }
        };
        more = n == chunk.len();

        if n == 0 {
            continue;
        }
        trace!("read {} bytes", n);
        acc.extend_from_slice(&chunk[..n]);
        drain_frames(&mut acc, max_message_size, &callback);
    }
}

/// Decode every complete frame in `acc` and feed it to the callback.
///
/// A frame that fails to decode is skipped when its declared length is
/// known, otherwise the buffer is discarded; either way the loop keeps the
/// stream alive.
fn drain_frames(
    acc: &mut BytesMut,
    max_message_size: usize,
    callback: &Arc<RwLock<Option<ReceiveCallback>>>,
) {
    loop {
        match packet::decode_packet(acc, max_message_size) {
            Ok(Some((decoded, consumed))) => {
                let _ = acc.split_to(consumed);
                emit(callback, Ok(decoded));
            }
            Ok(None) => break,
            Err(e) => {
                match packet::frame_length(acc)
                    .ok()
                    .flatten()
                    .filter(|len| *len <= acc.len())
                {
                    Some(len) => {
                        warn!("skipping undecodable {}-byte frame: {}", len, e);
                        let _ = acc.split_to(len);
                    }
                    None => {
                        warn!("discarding receive buffer after decode error: {}", e);
                        acc.clear();
                    }
                }
                emit(callback, Err(e));
            }
        }
    }
}

fn emit(
    callback: &Arc<RwLock<Option<ReceiveCallback>>>,
    result: Result<Packet, ProtocolError>,
) {
    if let Some(callback) = callback.read().as_ref() {
        callback(result);
    }
}
