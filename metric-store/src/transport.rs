//! Length-prefixed ingestion transport.
//!
//! Each frame is a little-endian `u32` payload length followed by one
//! encoded [`Batch`] (see [`crate::codec`]). There is no acknowledgement and
//! no retry: a sender learns about failures only from its own write, and a
//! receiver that cannot decode a frame drops it and moves on to the next.
//!
//! ```text
//! +-------------+---------------------------+
//! | len: u32 LE | payload: len bytes (MSB1) |
//! +-------------+---------------------------+
//! ```

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::codec;
use crate::error::TransportError;
use crate::metrics::{self, MetricsRegistrar};
use crate::point::Batch;
use crate::store::Store;

/// Largest accepted payload.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Writes frames to a byte stream.
///
/// A failed send poisons the sender: the stream may hold a partial frame, so
/// every later send fails with [`TransportError::Closed`] and the producer
/// has to reconnect.
#[derive(Debug)]
pub struct FrameSender<W: Write> {
    inner: W,
    buf: Vec<u8>,
    poisoned: bool,
}

/// A sender over TCP.
pub type TcpSender = FrameSender<TcpStream>;

impl<W: Write> FrameSender<W> {
    /// Wraps a writer.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            poisoned: false,
        }
    }

    /// Encodes and writes one batch as a single frame, then flushes.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Closed`] if an earlier send failed;
    /// - [`TransportError::Encode`] if a point exceeds a format limit;
    /// - [`TransportError::FrameTooLarge`] if the encoded batch exceeds
    ///   [`MAX_FRAME_SIZE`];
    ///
    /// In both of the last two cases nothing is written and the sender stays
    /// usable.
    /// - [`TransportError::Io`] if the write or flush fails.
    pub fn send(&mut self, batch: &Batch) -> Result<(), TransportError> {
        if self.poisoned {
            return Err(TransportError::Closed);
        }

        let size = codec::encoded_len(batch);
        if size > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }
        let len = u32::try_from(size).map_err(|_| TransportError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        })?;

        self.buf.clear();
        self.buf.reserve(LEN_PREFIX + size);
        self.buf.extend_from_slice(&len.to_le_bytes());
        codec::encode_into(batch, &mut self.buf)?;

        let result = self
            .inner
            .write_all(&self.buf)
            .and_then(|()| self.inner.flush());
        if let Err(e) = result {
            self.poisoned = true;
            tracing::warn!(error = %e, points = batch.len(), "send failed, sender closed");
            return Err(TransportError::Io(e));
        }
        Ok(())
    }

    /// Whether an earlier send failed.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl FrameSender<TcpStream> {
    /// Connects to an ingestion endpoint.
    ///
    /// `timeout` bounds both the connect and each later write.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the connection cannot be made.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, TransportError> {
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(TransportError::Io)?;
        stream
            .set_write_timeout(Some(timeout))
            .map_err(TransportError::Io)?;
        stream.set_nodelay(true).map_err(TransportError::Io)?;
        Ok(Self::new(stream))
    }
}

/// Reads frames from a byte stream.
#[derive(Debug)]
pub struct FrameReceiver<R: Read> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: Read> FrameReceiver<R> {
    /// Wraps a reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    /// Reads the next frame and decodes it.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Decode`]: the frame was consumed but its payload is
    ///   not a valid batch; the stream is still usable;
    /// - [`TransportError::Closed`]: the peer closed at a frame boundary;
    /// - [`TransportError::Framing`]: bad length prefix or EOF inside a frame;
    /// - [`TransportError::Timeout`]: the read timed out;
    /// - [`TransportError::Io`]: any other read failure.
    ///
    /// Only `Decode` leaves the stream positioned at a frame boundary.
    pub fn receive(&mut self) -> Result<Batch, TransportError> {
        let mut prefix = [0u8; LEN_PREFIX];
        match read_full(&mut self.inner, &mut prefix)? {
            0 => return Err(TransportError::Closed),
            LEN_PREFIX => {}
            n => {
                return Err(TransportError::Framing {
                    reason: format!("stream ended after {n} bytes of length prefix"),
                });
            }
        }

        let len = u32::from_le_bytes(prefix) as usize;
        if len == 0 {
            return Err(TransportError::Framing {
                reason: "zero-length frame".to_string(),
            });
        }
        if len > MAX_FRAME_SIZE {
            return Err(TransportError::Framing {
                reason: format!("frame of {len} bytes exceeds limit of {MAX_FRAME_SIZE}"),
            });
        }

        self.buf.resize(len, 0);
        let got = read_full(&mut self.inner, &mut self.buf)?;
        if got < len {
            return Err(TransportError::Framing {
                reason: format!("stream ended after {got} of {len} payload bytes"),
            });
        }

        Ok(codec::decode(&self.buf)?)
    }
}

/// Fills `buf` until it is full or the stream ends; returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(TransportError::Timeout);
            }
            Err(e) => return Err(TransportError::Io(e)),
        }
    }
    Ok(filled)
}

/// What one connection delivered.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSummary {
    /// Frames decoded and handed to the store.
    pub frames: u64,
    /// Points in those frames.
    pub points: u64,
    /// Frames dropped because they did not decode.
    pub dropped_frames: u64,
}

/// Feeds every frame from `receiver` into `store` until the stream ends.
///
/// Undecodable frames are dropped and counted. Store write errors are logged
/// (the store counts them) and do not end the connection.
pub fn serve_connection<R: Read>(
    receiver: &mut FrameReceiver<R>,
    store: &Store,
    registrar: &dyn MetricsRegistrar,
) -> ConnectionSummary {
    let mut summary = ConnectionSummary::default();
    loop {
        match receiver.receive() {
            Ok(batch) => {
                summary.frames += 1;
                summary.points += batch.len() as u64;
                #[allow(clippy::cast_precision_loss)]
                registrar.add(metrics::INGRESS_ENVELOPES_TOTAL, batch.len() as f64);
                if let Err(e) = store.write(&batch) {
                    tracing::warn!(error = %e, points = batch.len(), "ingest write failed");
                }
            }
            Err(TransportError::Decode(e)) => {
                summary.dropped_frames += 1;
                registrar.inc(metrics::DROPPED_ENVELOPES_TOTAL);
                tracing::warn!(error = %e, "dropped undecodable frame");
            }
            Err(TransportError::Closed) => {
                tracing::debug!(frames = summary.frames, "connection closed");
                return summary;
            }
            Err(e) => {
                tracing::warn!(error = %e, frames = summary.frames, "connection ended");
                return summary;
            }
        }
    }
}

/// Accepts ingestion connections and serves each on its own thread.
pub struct IngestServer {
    listener: TcpListener,
    store: Arc<Store>,
    registrar: Arc<dyn MetricsRegistrar>,
    idle_timeout: Duration,
}

impl std::fmt::Debug for IngestServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestServer")
            .field("listener", &self.listener)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl IngestServer {
    /// Binds the listening socket.
    ///
    /// Connections idle for longer than `idle_timeout` are closed.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the address cannot be bound.
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        store: Arc<Store>,
        registrar: Arc<dyn MetricsRegistrar>,
        idle_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).map_err(TransportError::Io)?;
        Ok(Self {
            listener,
            store,
            registrar,
            idle_timeout,
        })
    }

    /// The bound address.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the socket cannot report it.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener.local_addr().map_err(TransportError::Io)
    }

    /// Runs the accept loop. Blocks forever; intended for a dedicated thread.
    pub fn run(&self) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(%addr, "ingest server listening");
        }
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "accept error");
                    continue;
                }
            };
            if let Err(e) = self.spawn_connection(stream) {
                tracing::warn!(error = %e, "failed to start connection handler");
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream) -> io::Result<()> {
        stream.set_read_timeout(Some(self.idle_timeout))?;
        let peer = stream.peer_addr()?;
        let store = Arc::clone(&self.store);
        let registrar = Arc::clone(&self.registrar);
        thread::Builder::new()
            .name(format!("ingest-{peer}"))
            .spawn(move || {
                tracing::debug!(%peer, "connection accepted");
                let mut receiver = FrameReceiver::new(stream);
                let summary = serve_connection(&mut receiver, &store, registrar.as_ref());
                tracing::debug!(
                    %peer,
                    frames = summary.frames,
                    points = summary.points,
                    dropped = summary.dropped_frames,
                    "connection finished"
                );
            })?;
        Ok(())
    }
}
