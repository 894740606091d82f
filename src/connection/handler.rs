//! Connection I/O Task
//!
//! Every connection is driven by one Tokio task that owns the socket. The
//! task multiplexes three event sources:
//!
//! ```text
//!   outbound channel ──> write + flush (pipelined batches)
//!   socket readable  ──> read into buffer ──> parse replies ──> on_reply
//!   shutdown watch   ──> stop, socket dropped
//! ```
//!
//! The task reports to its owner through [`ConnectionEvents`], held as a
//! `Weak` reference so that a connection never keeps its endpoint alive.
//!
//! ## Buffer Management
//!
//! TCP is a stream: a read may contain half a reply or several pipelined
//! replies. Incoming bytes accumulate in a `BytesMut` and replies are split
//! off as soon as the parser reports one complete.

use crate::protocol::{ParseError, RespParser, RespValue};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// Initial read buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Statistics shared by every connection of a client
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections established
    pub connections_opened: AtomicU64,
    /// Currently open connections
    pub active_connections: AtomicU64,
    /// Reconnect attempts made by watchdogs
    pub reconnect_attempts: AtomicU64,
    /// Total replies decoded
    pub replies_received: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn reconnect_attempted(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reply_received(&self) {
        self.replies_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Callbacks from a connection task to the component that owns the
/// connection.
pub trait ConnectionEvents: Send + Sync {
    /// A complete reply arrived on `connection_id`.
    fn on_reply(&self, connection_id: u64, reply: RespValue);

    /// The connection dropped (EOF, I/O error).
    fn on_connection_lost(&self, connection_id: u64);

    /// The reply stream could not be decoded.
    fn on_protocol_error(&self, connection_id: u64, error: ParseError);
}

/// Errors that can occur while establishing or running a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// RESP parse error
    #[error("Parse error: {0}")]
    ParseError(#[from] ParseError),

    /// The TCP connect did not finish in time
    #[error("connect to {0} timed out")]
    Timeout(String),

    /// The connection task is gone
    #[error("connection closed")]
    Closed,

    /// The endpoint was closing; the new connection was discarded
    #[error("endpoint closed, connection discarded")]
    EndpointClosed,

    /// Spawning connection tasks requires a Tokio runtime
    #[error("no Tokio runtime available")]
    NoRuntime,

    /// The server closed the connection
    #[error("server closed the connection")]
    ServerDisconnected,

    /// Unexpected end of stream (partial reply)
    #[error("Unexpected end of stream")]
    UnexpectedEof,
}

/// The owner's handle on a running connection task.
///
/// Sending never blocks: bytes go through an unbounded channel to the task,
/// which writes them in order.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u64,
    peer: String,
    outbound: mpsc::UnboundedSender<Bytes>,
    shutdown: watch::Sender<bool>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Hands encoded commands to the connection task.
    pub fn send(&self, bytes: Bytes) -> Result<(), ConnectionError> {
        self.outbound
            .send(bytes)
            .map_err(|_| ConnectionError::Closed)
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Stops the connection task and closes the socket. The owner is not
    /// notified through [`ConnectionEvents::on_connection_lost`].
    pub fn release(self) {
        let _ = self.shutdown.send(true);
        debug!(connection = self.id, peer = %self.peer, "Connection released");
    }

    /// A handle not backed by a socket; tests read the outbound bytes from
    /// the returned receiver.
    #[cfg(test)]
    pub(crate) fn detached(
        peer: &str,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<Bytes>,
        watch::Receiver<bool>,
    ) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.to_string(),
            outbound,
            shutdown,
        };
        (handle, outbound_rx, shutdown_rx)
    }
}

/// Connects to `address` and spawns the connection task.
pub async fn connect(
    address: &str,
    events: Weak<dyn ConnectionEvents>,
    stats: Arc<ConnectionStats>,
    timeout: Duration,
) -> Result<ConnectionHandle, ConnectionError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| ConnectionError::Timeout(address.to_string()))??;
    stream.set_nodelay(true)?;
    Ok(spawn_connection(stream, address.to_string(), events, stats))
}

/// Spawns the task driving an already-connected stream.
pub fn spawn_connection(
    stream: TcpStream,
    peer: String,
    events: Weak<dyn ConnectionEvents>,
    stats: Arc<ConnectionStats>,
) -> ConnectionHandle {
    let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (reader, writer) = stream.into_split();

    let task = ConnectionTask {
        id,
        peer: peer.clone(),
        reader,
        writer: BufWriter::new(writer),
        buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
        parser: RespParser::new(),
        events,
        stats,
        outbound: outbound_rx,
        shutdown: shutdown_rx,
    };
    tokio::spawn(task.run());

    ConnectionHandle {
        id,
        peer,
        outbound: outbound_tx,
        shutdown: shutdown_tx,
    }
}

enum Event {
    Shutdown,
    Outbound(Option<Bytes>),
    Read(std::io::Result<usize>),
}

struct ConnectionTask {
    id: u64,
    peer: String,
    reader: OwnedReadHalf,
    writer: BufWriter<OwnedWriteHalf>,
    buffer: BytesMut,
    parser: RespParser,
    events: Weak<dyn ConnectionEvents>,
    stats: Arc<ConnectionStats>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionTask {
    async fn run(mut self) {
        self.stats.connection_opened();
        info!(connection = self.id, peer = %self.peer, "Connected");

        let result = self.main_loop().await;
        self.stats.connection_closed();

        match result {
            Ok(()) => trace!(connection = self.id, "Connection task stopped"),
            Err(ConnectionError::ParseError(e)) => {
                error!(connection = self.id, peer = %self.peer, error = %e, "Undecodable reply stream");
                if let Some(events) = self.events.upgrade() {
                    events.on_protocol_error(self.id, e);
                }
            }
            Err(e) => {
                match &e {
                    ConnectionError::ServerDisconnected => {
                        debug!(connection = self.id, peer = %self.peer, "Server closed connection")
                    }
                    ConnectionError::IoError(io_err)
                        if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
                    {
                        debug!(connection = self.id, peer = %self.peer, "Connection reset by server")
                    }
                    _ => warn!(connection = self.id, peer = %self.peer, error = %e, "Connection error"),
                }
                if let Some(events) = self.events.upgrade() {
                    events.on_connection_lost(self.id);
                }
            }
        }
    }

    /// Returns `Ok(())` when released by the owner, an error when the
    /// connection was lost.
    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            let event = tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        Event::Shutdown
                    } else {
                        continue;
                    }
                }
                bytes = self.outbound.recv() => Event::Outbound(bytes),
                read = self.reader.read_buf(&mut self.buffer) => Event::Read(read),
            };

            match event {
                Event::Shutdown => return Ok(()),
                Event::Outbound(None) => return Ok(()),
                Event::Outbound(Some(bytes)) => self.write_batch(bytes).await?,
                Event::Read(read) => {
                    let n = read?;
                    if n == 0 {
                        return Err(if self.buffer.is_empty() {
                            ConnectionError::ServerDisconnected
                        } else {
                            ConnectionError::UnexpectedEof
                        });
                    }
                    self.stats.bytes_read(n);
                    trace!(connection = self.id, bytes = n, "Read data");
                    self.dispatch_replies()?;
                }
            }
        }
    }

    /// Writes `first` plus whatever else is already waiting, then flushes
    /// once.
    async fn write_batch(&mut self, first: Bytes) -> Result<(), ConnectionError> {
        let mut written = first.len();
        self.writer.write_all(&first).await?;
        while let Ok(more) = self.outbound.try_recv() {
            written += more.len();
            self.writer.write_all(&more).await?;
        }
        self.writer.flush().await?;
        self.stats.bytes_written(written);
        trace!(connection = self.id, bytes = written, "Sent commands");
        Ok(())
    }

    fn dispatch_replies(&mut self) -> Result<(), ConnectionError> {
        let events = self.events.upgrade().ok_or(ConnectionError::Closed)?;
        while let Some((reply, consumed)) = self.parser.parse(&self.buffer)? {
            let _ = self.buffer.split_to(consumed);
            self.stats.reply_received();
            trace!(
                connection = self.id,
                consumed = consumed,
                remaining = self.buffer.len(),
                "Parsed reply"
            );
            events.on_reply(self.id, reply);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Recorder {
        replies: Mutex<Vec<(u64, RespValue)>>,
        lost: Mutex<Vec<u64>>,
        protocol_errors: Mutex<Vec<u64>>,
    }

    impl ConnectionEvents for Recorder {
        fn on_reply(&self, connection_id: u64, reply: RespValue) {
            self.replies.lock().unwrap().push((connection_id, reply));
        }

        fn on_connection_lost(&self, connection_id: u64) {
            self.lost.lock().unwrap().push(connection_id);
        }

        fn on_protocol_error(&self, connection_id: u64, _error: ParseError) {
            self.protocol_errors.lock().unwrap().push(connection_id);
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    async fn connect_recorder(
        listener: &TcpListener,
    ) -> (ConnectionHandle, TcpStream, Arc<Recorder>, Arc<ConnectionStats>) {
        let addr = listener.local_addr().unwrap().to_string();
        let recorder = Arc::new(Recorder::default());
        let events: Arc<dyn ConnectionEvents> = recorder.clone();
        let stats = Arc::new(ConnectionStats::new());
        let handle = connect(
            &addr,
            Arc::downgrade(&events),
            Arc::clone(&stats),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (handle, server, recorder, stats)
    }

    #[tokio::test]
    async fn test_pipelined_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (handle, mut server, recorder, stats) = connect_recorder(&listener).await;

        handle
            .send(Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"))
            .unwrap();
        handle
            .send(Bytes::from_static(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n"))
            .unwrap();

        let expected = b"*1\r\n$4\r\nPING\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n";
        let mut received = vec![0u8; expected.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(&received[..], &expected[..]);

        // Replies split across writes are reassembled.
        server.write_all(b"+PONG\r\n$1\r").await.unwrap();
        settle().await;
        server.write_all(b"\nv\r\n").await.unwrap();
        settle().await;

        let replies = recorder.replies.lock().unwrap().clone();
        assert_eq!(
            replies,
            vec![
                (handle.id(), RespValue::simple_string("PONG")),
                (handle.id(), RespValue::bulk_string("v")),
            ]
        );
        assert_eq!(stats.replies_received.load(Ordering::Relaxed), 2);
        assert!(stats.bytes_written.load(Ordering::Relaxed) >= expected.len() as u64);
    }

    #[tokio::test]
    async fn test_server_close_reports_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (handle, server, recorder, stats) = connect_recorder(&listener).await;

        drop(server);
        settle().await;

        assert_eq!(*recorder.lost.lock().unwrap(), vec![handle.id()]);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn test_release_does_not_report_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (handle, mut server, recorder, _stats) = connect_recorder(&listener).await;

        handle.release();
        let mut buf = [0u8; 8];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        settle().await;

        assert!(recorder.lost.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_reports_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (handle, mut server, recorder, _stats) = connect_recorder(&listener).await;

        server.write_all(b"@garbage\r\n").await.unwrap();
        settle().await;

        assert_eq!(*recorder.protocol_errors.lock().unwrap(), vec![handle.id()]);
        assert!(recorder.lost.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let recorder: Arc<dyn ConnectionEvents> = Arc::new(Recorder::default());
        let result = connect(
            &addr,
            Arc::downgrade(&recorder),
            Arc::new(ConnectionStats::new()),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(ConnectionError::IoError(_))));
    }
}
