//! Per-connection handler: frames in, records out.
//!
//! A malformed message is logged and dropped; the connection stays open.
//! Only the end of the stream, a stop request, a socket error or a frame
//! header that cannot be trusted ends the connection.

use crate::buffer::IngestBuffer;
use crate::framing::{Frame, FrameEnd, FrameError, FrameReader};
use fm_protocol::decode_payload;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub idle_timeout: Duration,
    pub max_frame_bytes: u32,
}

/// Per-connection counters, reported when the connection ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub frames: u64,
    pub records: u64,
    pub rejected: u64,
}

/// Drive one connection until it ends.  The stream is dropped (closed) on
/// return whatever the reason.
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    buffer: IngestBuffer,
    settings: ConnectionSettings,
    shutdown: watch::Receiver<bool>,
) -> ConnectionSummary
where
    S: AsyncRead + Unpin,
{
    debug!(peer = %peer, "sensor connected");
    let mut reader = FrameReader::new(stream, settings.idle_timeout, shutdown);
    let mut summary = ConnectionSummary::default();

    let reason = loop {
        let payload = match reader.next_frame(settings.max_frame_bytes).await {
            Ok(Frame::Payload(payload)) => payload,
            Ok(Frame::End(FrameEnd::Closed)) => break "peer closed",
            Ok(Frame::End(FrameEnd::Stopped)) => break "stop requested",
            Ok(Frame::End(FrameEnd::ZeroLength)) => break "zero-length frame",
            Err(e @ FrameError::TooLarge { .. }) => {
                warn!(peer = %peer, error = %e, "closing connection on untrusted frame header");
                break "oversized frame";
            }
            Err(FrameError::Io(e)) => {
                warn!(peer = %peer, error = %e, "failed to receive data");
                break "socket error";
            }
        };
        summary.frames += 1;

        match decode_payload(&payload) {
            Ok(decoded) => {
                if !decoded.ignored_keys.is_empty() {
                    debug!(peer = %peer, keys = ?decoded.ignored_keys, "ignoring non-record keys");
                }
                let count = decoded.records.len() as u64;
                buffer.append(decoded.records).await;
                summary.records += count;
                trace!(peer = %peer, records = count, "records appended");
            }
            Err(e) => {
                summary.rejected += 1;
                warn!(
                    peer = %peer,
                    bytes = payload.len(),
                    error = %e,
                    "dropping malformed message"
                );
            }
        }
    };

    debug!(
        peer = %peer,
        reason,
        frames = summary.frames,
        records = summary.records,
        rejected = summary.rejected,
        "sensor disconnected"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use fm_protocol::{Record, encode_frame};
    use tokio::io::{AsyncWriteExt, duplex};

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            idle_timeout: Duration::from_millis(20),
            max_frame_bytes: 4096,
        }
    }

    fn peer() -> SocketAddr {
        "192.0.2.10:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn appends_records_and_skips_malformed_messages() {
        let (mut tx, rx) = duplex(4096);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let buffer = IngestBuffer::new();
        let task = tokio::spawn(handle_connection(rx, peer(), buffer.clone(), settings(), stop_rx));

        tx.write_all(&encode_frame(br#"{"timestamp":"t0","temp":-18.5,"rh":39}"#).unwrap())
            .await
            .unwrap();
        tx.write_all(&encode_frame(b"{not json").unwrap()).await.unwrap();
        tx.write_all(
            &encode_frame(br#"{"timestamp":["t1","t2"],"temp":[-18.0,-17.5],"rh":[40,41]}"#)
                .unwrap(),
        )
        .await
        .unwrap();
        tx.write_all(&0u32.to_le_bytes()).await.unwrap();

        let summary = task.await.unwrap();
        assert_eq!(
            summary,
            ConnectionSummary {
                frames: 3,
                records: 3,
                rejected: 1
            }
        );
        assert_eq!(
            buffer.snapshot().await,
            vec![
                Record::new("t0", -18.5, 39.0),
                Record::new("t1", -18.0, 40.0),
                Record::new("t2", -17.5, 41.0),
            ]
        );
    }

    #[tokio::test]
    async fn unequal_arrays_append_nothing() {
        let (mut tx, rx) = duplex(4096);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let buffer = IngestBuffer::new();
        let task = tokio::spawn(handle_connection(rx, peer(), buffer.clone(), settings(), stop_rx));

        tx.write_all(
            &encode_frame(br#"{"timestamp":["a","b","c"],"temp":[1,2,3],"rh":[4,5]}"#).unwrap(),
        )
        .await
        .unwrap();
        drop(tx);

        let summary = task.await.unwrap();
        assert_eq!(summary.rejected, 1);
        assert!(buffer.is_empty().await);
    }

    #[tokio::test]
    async fn oversized_header_ends_connection() {
        let (mut tx, rx) = duplex(4096);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let buffer = IngestBuffer::new();
        let task = tokio::spawn(handle_connection(rx, peer(), buffer.clone(), settings(), stop_rx));

        tx.write_all(&u32::MAX.to_le_bytes()).await.unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("handler should return")
            .unwrap();
        assert_eq!(summary.frames, 0);
        assert!(buffer.is_empty().await);
    }

    #[tokio::test]
    async fn stop_ends_idle_connection() {
        let (_tx, rx) = duplex(4096);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(handle_connection(
            rx,
            peer(),
            IngestBuffer::new(),
            settings(),
            stop_rx,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("handler should stop")
            .unwrap();
    }
}
