use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::curl::CommandSink;
use crate::filter::TrafficFilter;
use crate::redirect::RedirectTrace;

/// Bytes read from one side per relay iteration
pub const RELAY_CHUNK_SIZE: usize = 4096;

/// Which way bytes travel through a [`Pipe`]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    /// near -> far (client requests)
    Request,
    /// far -> near (destination responses)
    Response,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Request => f.write_str("near->far"),
            Direction::Response => f.write_str("far->near"),
        }
    }
}

/// How a relay stopped: the first direction to terminate ends both
#[derive(Debug)]
pub enum PipeEnd {
    /// The source of `direction` reached end of stream
    Closed { direction: Direction, bytes: u64 },
    /// A read or write in `direction` failed
    Failed { direction: Direction, bytes: u64, error: io::Error },
}

impl PipeEnd {
    pub fn direction(&self) -> Direction {
        match self {
            PipeEnd::Closed { direction, .. } | PipeEnd::Failed { direction, .. } => *direction,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, PipeEnd::Failed { .. })
    }
}

impl fmt::Display for PipeEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeEnd::Closed { direction, bytes } => {
                write!(f, "{} closed after {} bytes", direction, bytes)
            }
            PipeEnd::Failed { direction, bytes, error } => {
                write!(f, "{} failed after {} bytes: {}", direction, bytes, error)
            }
        }
    }
}

/// Shared handles a pipe needs to inspect HTTP traffic
#[derive(Clone)]
pub struct Inspector {
    pub trace: Arc<RedirectTrace>,
    pub sink: Arc<dyn CommandSink>,
}

impl Inspector {
    pub fn new(trace: Arc<RedirectTrace>, sink: Arc<dyn CommandSink>) -> Self {
        Self { trace, sink }
    }
}

impl fmt::Debug for Inspector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inspector").field("trace", &self.trace).finish_non_exhaustive()
    }
}

/// Per-pipe filter state; both directions run on the same task, so the
/// lock is never contended and never held across an await.
struct Inspection {
    filter: Mutex<TrafficFilter>,
    sink: Arc<dyn CommandSink>,
}

impl Inspection {
    fn observe(&self, direction: Direction, chunk: &[u8]) {
        let mut filter = self.filter.lock().unwrap_or_else(PoisonError::into_inner);
        match direction {
            Direction::Request => filter.observe_request(chunk),
            Direction::Response => {
                if let Some(command) = filter.observe_response(chunk) {
                    drop(filter);
                    debug!(%command, "download command reconstructed");
                    self.sink.emit(&command);
                }
            }
        }
    }
}

/// Bidirectional relay between two established streams.
///
/// Both directions are driven concurrently; when either one reaches end of
/// stream or fails, both streams are shut down and dropped.
pub struct Pipe<N, F> {
    near: N,
    far: F,
    inspection: Option<Inspection>,
    conn_id: u64,
}

impl<N, F> Pipe<N, F>
where
    N: AsyncRead + AsyncWrite,
    F: AsyncRead + AsyncWrite,
{
    pub fn new(near: N, far: F) -> Self {
        Self {
            near,
            far,
            inspection: None,
            conn_id: 0,
        }
    }

    /// Attach a traffic filter observing both directions
    pub fn inspect(mut self, inspector: Option<Inspector>) -> Self {
        self.inspection = inspector.map(|inspector| Inspection {
            filter: Mutex::new(TrafficFilter::new(inspector.trace)),
            sink: inspector.sink,
        });
        self
    }

    /// Tag log lines with a connection id
    pub fn conn_id(mut self, conn_id: u64) -> Self {
        self.conn_id = conn_id;
        self
    }

    /// Relay until one direction terminates
    pub async fn run(self) -> PipeEnd {
        let Pipe {
            near,
            far,
            inspection,
            conn_id,
        } = self;

        let (mut near_reader, mut near_writer) = tokio::io::split(near);
        let (mut far_reader, mut far_writer) = tokio::io::split(far);
        let inspection = inspection.as_ref();

        let end = tokio::select! {
            end = pump(&mut near_reader, &mut far_writer, Direction::Request, inspection) => end,
            end = pump(&mut far_reader, &mut near_writer, Direction::Response, inspection) => end,
        };

        // the peer is usually gone already, so shutdown errors are expected
        let _ = far_writer.shutdown().await;
        let _ = near_writer.shutdown().await;

        if end.is_failure() {
            debug!(conn = conn_id, direction = %end.direction(), "relay failed: {}", end);
        } else {
            trace!(conn = conn_id, direction = %end.direction(), "relay ended: {}", end);
        }
        end
    }
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    inspection: Option<&Inspection>,
) -> PipeEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
    let mut bytes = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return PipeEnd::Closed { direction, bytes },
            Ok(n) => n,
            Err(error) => return PipeEnd::Failed { direction, bytes, error },
        };

        if let Some(inspection) = inspection {
            inspection.observe(direction, &buf[..n]);
        }

        if let Err(error) = writer.write_all(&buf[..n]).await {
            return PipeEnd::Failed { direction, bytes, error };
        }
        bytes += n as u64;
    }
}
