//! Persistent, newline-framed duplex connection to a single Electrum server.
//!
//! A [`Connection`] owns two background tasks:
//! - a reader that splits the byte stream on `\n` and publishes every frame
//!   into a bounded channel (publishing waits when the consumer lags, so
//!   frames are never dropped), ending with exactly one terminal error;
//! - a writer that drains a queue of outbound messages, so any number of
//!   [`FrameSink`] clones can send concurrently without interleaving bytes.
//!
//! Every frame in either direction is logged at `trace` level under the
//! `prevout::wire` target; enable it through the tracing filter.

mod address;
mod tls;

pub use address::{parse_server, ServerAddr};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::TransportError;

/// Byte that terminates every protocol message.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Verbose transactions and long histories fit comfortably below this.
pub const DEFAULT_MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// A received frame (delimiter stripped) or the connection's terminal error.
pub type FrameResult = Result<Vec<u8>, TransportError>;

// ==============================================================================
// Options
// ==============================================================================

/// Server certificate validation for TLS connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertificatePolicy {
    /// Validate against the bundled Mozilla root store.
    #[default]
    WebPki,
    /// Accept any certificate. Development only.
    AcceptInvalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    Plaintext,
    Tls(CertificatePolicy),
}

impl Security {
    /// TLS for `ssl://` addresses, plaintext otherwise.
    pub fn for_address(addr: &ServerAddr, policy: CertificatePolicy) -> Self {
        if addr.tls {
            Security::Tls(policy)
        } else {
            Security::Plaintext
        }
    }
}

#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Bound on TCP connect plus TLS handshake.
    pub connect_timeout: Option<Duration>,
    /// Capacity of the received-frame channel and of the outbound queue.
    pub frame_buffer: usize,
    /// Longest accepted frame, delimiter excluded. A longer frame ends the
    /// connection with [`TransportError::Read`].
    pub max_frame_len: usize,
    pub nodelay: bool,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            frame_buffer: 64,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            nodelay: true,
        }
    }
}

// ==============================================================================
// Connection
// ==============================================================================

pub struct Connection {
    peer: Arc<str>,
    sink: FrameSink,
    frames: FrameStream,
}

impl Connection {
    /// Dial `addr`, completing the TLS handshake (if any) before the reader
    /// task starts.
    pub async fn open(
        addr: &ServerAddr,
        security: Security,
        options: &DialOptions,
    ) -> Result<Self, TransportError> {
        let authority = addr.authority();
        let deadline = options.connect_timeout.map(|t| Instant::now() + t);

        let tcp = within(deadline, &authority, TcpStream::connect(authority.as_str()))
            .await?
            .map_err(|source| TransportError::Connect {
                addr: authority.clone(),
                source,
            })?;
        if let Err(err) = tcp.set_nodelay(options.nodelay) {
            warn!(peer = %authority, error = %err, "failed to set TCP_NODELAY");
        }

        match security {
            Security::Plaintext => {
                debug!(peer = %authority, "connected");
                Ok(Self::from_stream(tcp, authority, options))
            }
            Security::Tls(policy) => {
                let connector = tls::connector(policy)?;
                let server_name = tls::server_name(&addr.host)?;
                let stream = within(deadline, &authority, connector.connect(server_name, tcp))
                    .await?
                    .map_err(|source| TransportError::Handshake {
                        addr: authority.clone(),
                        source,
                    })?;
                debug!(peer = %authority, ?policy, "connected with TLS");
                Ok(Self::from_stream(stream, authority, options))
            }
        }
    }

    /// Run the framing tasks over an already established stream.
    pub fn from_stream<S>(stream: S, peer: impl Into<String>, options: &DialOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer: Arc<str> = Arc::from(peer.into());
        let capacity = options.frame_buffer.max(1);
        let (read_half, write_half) = tokio::io::split(stream);

        let (frame_tx, frame_rx) = mpsc::channel(capacity);
        let reader = tokio::spawn(read_frames(
            BufReader::new(read_half),
            frame_tx,
            options.max_frame_len.max(1),
            peer.clone(),
        ));

        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        tokio::spawn(write_frames(write_half, outbound_rx, peer.clone()));

        Self {
            peer: peer.clone(),
            sink: FrameSink {
                queue: outbound_tx,
                peer,
            },
            frames: FrameStream {
                rx: frame_rx,
                reader,
            },
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn sink(&self) -> FrameSink {
        self.sink.clone()
    }

    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.sink.send(bytes).await
    }

    /// Next frame, the terminal error, or `None` once the terminal error has
    /// been taken.
    pub async fn next_frame(&mut self) -> Option<FrameResult> {
        self.frames.next().await
    }

    pub fn into_parts(self) -> (FrameSink, FrameStream) {
        (self.sink, self.frames)
    }
}

/// Cloneable handle for sending raw bytes. Sends are serialized by the
/// connection's writer task; each call resolves once its bytes are flushed.
#[derive(Clone)]
pub struct FrameSink {
    queue: mpsc::Sender<Outbound>,
    peer: Arc<str>,
}

impl FrameSink {
    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let (done, written) = oneshot::channel();
        self.queue
            .send(Outbound { bytes, done })
            .await
            .map_err(|_| TransportError::Closed)?;
        written.await.unwrap_or(Err(TransportError::Closed))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

/// Received frames. Dropping the stream stops the reader task.
pub struct FrameStream {
    rx: mpsc::Receiver<FrameResult>,
    reader: JoinHandle<()>,
}

impl FrameStream {
    pub async fn next(&mut self) -> Option<FrameResult> {
        self.rx.recv().await
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ==============================================================================
// Background Tasks
// ==============================================================================

struct Outbound {
    bytes: Vec<u8>,
    done: oneshot::Sender<Result<(), TransportError>>,
}

async fn read_frames<R>(
    mut reader: R,
    frames: mpsc::Sender<FrameResult>,
    max_frame_len: usize,
    peer: Arc<str>,
) where
    R: AsyncBufRead + Unpin,
{
    // One byte of headroom for the delimiter.
    let limit = max_frame_len as u64 + 1;
    let terminal = loop {
        let mut frame = Vec::new();
        match (&mut reader)
            .take(limit)
            .read_until(FRAME_DELIMITER, &mut frame)
            .await
        {
            Ok(0) => break TransportError::Closed,
            Ok(len) if frame.last() != Some(&FRAME_DELIMITER) && len as u64 == limit => {
                warn!(peer = %peer, max_frame_len, "frame exceeds size limit; closing connection");
                break TransportError::Read(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("frame longer than {max_frame_len} bytes"),
                ));
            }
            Ok(_) if frame.last() != Some(&FRAME_DELIMITER) => {
                debug!(peer = %peer, len = frame.len(), "discarding partial frame at end of stream");
                break TransportError::Closed;
            }
            Ok(_) => {
                frame.pop();
                trace!(
                    target: "prevout::wire",
                    peer = %peer,
                    frame = %String::from_utf8_lossy(&frame),
                    "<-"
                );
                if frames.send(Ok(frame)).await.is_err() {
                    debug!(peer = %peer, "frame consumer gone; stopping reader");
                    return;
                }
            }
            Err(err) => break TransportError::Read(err),
        }
    };

    debug!(peer = %peer, error = %terminal, "connection reader finished");
    let _ = frames.send(Err(terminal)).await;
}

async fn write_frames<W>(mut writer: W, mut queue: mpsc::Receiver<Outbound>, peer: Arc<str>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(Outbound { bytes, done }) = queue.recv().await {
        trace!(
            target: "prevout::wire",
            peer = %peer,
            frame = %String::from_utf8_lossy(bytes.strip_suffix(&[FRAME_DELIMITER]).unwrap_or(&bytes)),
            "->"
        );
        let written = match writer.write_all(&bytes).await {
            Ok(()) => writer.flush().await,
            Err(err) => Err(err),
        }
        .map_err(TransportError::Write);

        let failed = written.is_err();
        let _ = done.send(written);
        if failed {
            debug!(peer = %peer, "write failed; stopping writer");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn within<F: Future>(
    deadline: Option<Instant>,
    addr: &str,
    fut: F,
) -> Result<F::Output, TransportError> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                addr: addr.to_owned(),
            }),
        None => Ok(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    fn options(frame_buffer: usize) -> DialOptions {
        DialOptions {
            frame_buffer,
            ..DialOptions::default()
        }
    }

    #[tokio::test]
    async fn splits_frames_and_ends_with_single_terminal_error() {
        let (client, mut server) = duplex(1024);
        let mut conn = Connection::from_stream(client, "duplex", &options(8));

        server.write_all(b"{\"a\":1}\n{\"b\":2}\n").await.unwrap();
        drop(server);

        assert_eq!(conn.next_frame().await.unwrap().unwrap(), b"{\"a\":1}");
        assert_eq!(conn.next_frame().await.unwrap().unwrap(), b"{\"b\":2}");
        assert!(matches!(
            conn.next_frame().await,
            Some(Err(TransportError::Closed))
        ));
        assert!(conn.next_frame().await.is_none(), "nothing after the terminal error");
    }

    #[tokio::test]
    async fn partial_trailing_frame_is_not_published() {
        let (client, mut server) = duplex(1024);
        let mut conn = Connection::from_stream(client, "duplex", &options(8));

        server.write_all(b"complete\nincomple").await.unwrap();
        drop(server);

        assert_eq!(conn.next_frame().await.unwrap().unwrap(), b"complete");
        assert!(matches!(
            conn.next_frame().await,
            Some(Err(TransportError::Closed))
        ));
    }

    #[tokio::test]
    async fn oversized_frame_ends_the_connection() {
        let (client, mut server) = duplex(1024);
        let options = DialOptions {
            max_frame_len: 8,
            ..options(8)
        };
        let mut conn = Connection::from_stream(client, "duplex", &options);

        // Exactly at the limit is fine; the next frame never terminates.
        server.write_all(b"12345678\n").await.unwrap();
        server.write_all(&[b'x'; 64]).await.unwrap();

        assert_eq!(conn.next_frame().await.unwrap().unwrap(), b"12345678");
        match conn.next_frame().await {
            Some(Err(TransportError::Read(err))) => {
                assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
            }
            other => panic!("expected oversized frame error, got {other:?}"),
        }
        assert!(conn.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn slow_consumer_applies_back_pressure_without_dropping() {
        let (client, mut server) = duplex(64);
        let mut conn = Connection::from_stream(client, "duplex", &options(1));

        let producer = tokio::spawn(async move {
            for i in 0..200 {
                server
                    .write_all(format!("{i}\n").as_bytes())
                    .await
                    .unwrap();
            }
        });

        for i in 0..200 {
            let frame = conn.next_frame().await.unwrap().unwrap();
            assert_eq!(frame, i.to_string().into_bytes());
        }
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_sends_do_not_interleave() {
        let (client, server) = duplex(256);
        let conn = Connection::from_stream(client, "duplex", &options(4));

        let mut handles = Vec::new();
        for i in 0..20 {
            let sink = conn.sink();
            handles.push(tokio::spawn(async move {
                let msg = format!("message-{i}-{}\n", "x".repeat(100));
                sink.send(msg.into_bytes()).await
            }));
        }

        let mut reader = BufReader::new(server);
        let mut seen = Vec::new();
        for _ in 0..20 {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert!(line.starts_with("message-"), "corrupted line: {line}");
            assert!(line.ends_with(&format!("{}\n", "x".repeat(100))));
            seen.push(line);
        }
        for handle in handles {
            handle.await.unwrap().expect("send must succeed");
        }
        assert_eq!(seen.len(), 20);
    }

    #[tokio::test]
    async fn plaintext_open_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read);
            let mut line = String::new();
            lines.read_line(&mut line).await.unwrap();
            write.write_all(line.as_bytes()).await.unwrap();
        });

        let addr = parse_server(&format!("tcp://127.0.0.1:{port}")).unwrap();
        let mut conn = Connection::open(&addr, Security::Plaintext, &DialOptions::default())
            .await
            .expect("must connect");
        conn.send(b"ping\n".to_vec()).await.unwrap();
        assert_eq!(conn.next_frame().await.unwrap().unwrap(), b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn open_reports_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let addr = parse_server(&format!("127.0.0.1:{port}")).unwrap();
        let err = Connection::open(&addr, Security::Plaintext, &DialOptions::default())
            .await
            .err()
            .expect("nothing is listening");
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
