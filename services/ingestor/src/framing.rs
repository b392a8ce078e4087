//! Framed message reader.
//!
//! A single `read` on a stream socket may return fewer bytes than asked
//! for, so frames are accumulated across receive calls.  Each call is
//! bounded by the idle timeout; a timeout is not an error, it only gives the
//! loop a chance to notice a stop request.

use fm_protocol::{HEADER_LEN, decode_header};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;

/// Result of one receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvStatus {
    Data(usize),
    TimedOut,
    Closed,
    Stopped,
}

/// Result of reading an exact number of bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Complete(Vec<u8>),
    /// The peer closed the connection; any partial bytes are discarded.
    Closed,
    Stopped,
}

/// Result of reading one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Payload(Vec<u8>),
    End(FrameEnd),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEnd {
    Closed,
    Stopped,
    /// A zero-length header, which the sender uses to say it is done.
    ZeroLength,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame announces {len} bytes, limit is {max}")]
    TooLarge { len: u32, max: u32 },
}

pub struct FrameReader<R> {
    stream: R,
    idle_timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(stream: R, idle_timeout: Duration, shutdown: watch::Receiver<bool>) -> Self {
        FrameReader {
            stream,
            idle_timeout,
            shutdown,
        }
    }

    async fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<RecvStatus> {
        if *self.shutdown.borrow() {
            return Ok(RecvStatus::Stopped);
        }
        tokio::select! {
            res = timeout(self.idle_timeout, self.stream.read(buf)) => match res {
                Err(_) => Ok(RecvStatus::TimedOut),
                Ok(Ok(0)) => Ok(RecvStatus::Closed),
                Ok(Ok(n)) => Ok(RecvStatus::Data(n)),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => {
                    Ok(RecvStatus::TimedOut)
                }
                Ok(Err(e)) => Err(e),
            },
            // A dropped sender counts as a stop request too.
            _ = self.shutdown.changed() => Ok(RecvStatus::Stopped),
        }
    }

    /// Read exactly `len` bytes, retrying across timeouts and short reads.
    pub async fn read_exact(&mut self, len: usize) -> std::io::Result<ReadOutcome> {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match self.recv(&mut buf[filled..]).await? {
                RecvStatus::Data(n) => filled += n,
                RecvStatus::TimedOut => {
                    debug!(filled, wanted = len, "no data before timeout");
                }
                RecvStatus::Closed => return Ok(ReadOutcome::Closed),
                RecvStatus::Stopped => return Ok(ReadOutcome::Stopped),
            }
        }
        Ok(ReadOutcome::Complete(buf))
    }

    /// Read one length-prefixed frame.
    pub async fn next_frame(&mut self, max_len: u32) -> Result<Frame, FrameError> {
        let header = match self.read_exact(HEADER_LEN).await? {
            ReadOutcome::Complete(bytes) => bytes,
            ReadOutcome::Closed => return Ok(Frame::End(FrameEnd::Closed)),
            ReadOutcome::Stopped => return Ok(Frame::End(FrameEnd::Stopped)),
        };
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&header);
        let len = decode_header(raw);
        if len == 0 {
            return Ok(Frame::End(FrameEnd::ZeroLength));
        }
        if len > max_len {
            return Err(FrameError::TooLarge { len, max: max_len });
        }

        match self.read_exact(len as usize).await? {
            ReadOutcome::Complete(payload) => Ok(Frame::Payload(payload)),
            ReadOutcome::Closed => Ok(Frame::End(FrameEnd::Closed)),
            ReadOutcome::Stopped => Ok(Frame::End(FrameEnd::Stopped)),
        }
    }
}
