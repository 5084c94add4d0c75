//! TCP relay engine: copies bytes both ways between the two ends of a session.

use std::future::pending;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use crate::shared::SessionLimits;

/// Size of the copy buffer in each direction.
const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Why a relay session ended without an I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// One side reached end-of-stream.
    Eof,
    /// No byte moved in either direction for the idle timeout.
    Idle,
    /// The absolute session deadline was reached.
    Deadline,
    /// The session or its control connection was closed.
    Cancelled,
}

/// Last time a byte moved in either direction, shared by both copy loops.
#[derive(Debug)]
pub struct Activity {
    origin: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    /// Start tracking, counting now as activity.
    pub fn new() -> Self {
        Activity {
            origin: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    /// Record that bytes were transferred.
    pub fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_millis.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Time since the last transfer.
    pub fn idle(&self) -> Duration {
        let last = self.origin + Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        Instant::now().saturating_duration_since(last)
    }

    /// Resolves once nothing has moved for `timeout`. A zero timeout never fires.
    pub async fn expired(&self, timeout: Duration) {
        if timeout.is_zero() {
            return pending().await;
        }
        loop {
            let idle = self.idle();
            if idle >= timeout {
                return;
            }
            sleep(timeout - idle).await;
        }
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Relay bytes between two streams until one closes, a timer fires, or `cancel` is triggered.
///
/// Each direction runs as its own task. When the session ends for any reason
/// both tasks are aborted and both streams are dropped, so closing one side
/// always closes the other.
pub async fn relay<S1, S2>(
    stream1: S1,
    stream2: S2,
    limits: &SessionLimits,
    cancel: CancellationToken,
) -> io::Result<CloseReason>
where
    S1: AsyncRead + AsyncWrite + Send + 'static,
    S2: AsyncRead + AsyncWrite + Send + 'static,
{
    let (s1_read, s1_write) = io::split(stream1);
    let (s2_read, s2_write) = io::split(stream2);
    let activity = Arc::new(Activity::new());

    let mut forward = AbortOnDropHandle::new(tokio::spawn(pump(
        s1_read,
        s2_write,
        Arc::clone(&activity),
    )));
    let mut backward = AbortOnDropHandle::new(tokio::spawn(pump(
        s2_read,
        s1_write,
        Arc::clone(&activity),
    )));

    let tcp_deadline = limits.tcp_deadline;
    let deadline = async move {
        if tcp_deadline.is_zero() {
            pending::<()>().await;
        }
        sleep(tcp_deadline).await;
    };

    tokio::select! {
        res = &mut forward => finished(res),
        res = &mut backward => finished(res),
        _ = activity.expired(limits.tcp_timeout) => Ok(CloseReason::Idle),
        _ = deadline => Ok(CloseReason::Deadline),
        _ = cancel.cancelled() => Ok(CloseReason::Cancelled),
    }
}

fn finished(res: Result<io::Result<u64>, tokio::task::JoinError>) -> io::Result<CloseReason> {
    match res {
        Ok(Ok(_)) => Ok(CloseReason::Eof),
        Ok(Err(err)) => Err(err),
        Err(err) => Err(io::Error::new(io::ErrorKind::Other, err)),
    }
}

async fn pump<R, W>(mut reader: R, mut writer: W, activity: Arc<Activity>) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        activity.touch();
        total += n as u64;
    }
}
