use fm_protocol::{Record, encode_frame, encode_payload};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// A sensor stand-in that writes frames to the ingestor.
pub struct MockSensor {
    stream: TcpStream,
}

impl MockSensor {
    pub async fn connect(addr: SocketAddr) -> Result<Self, Box<dyn std::error::Error>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Send an arbitrary JSON value as one frame.
    pub async fn send_json(
        &mut self,
        value: &serde_json::Value,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let body = serde_json::to_vec(value)?;
        self.send_payload_bytes(&body).await
    }

    /// Frame and send raw payload bytes, valid JSON or not.
    pub async fn send_payload_bytes(&mut self, body: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
        let frame = encode_frame(body)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    pub async fn send_records(&mut self, records: &[Record]) -> Result<(), Box<dyn std::error::Error>> {
        let body = encode_payload(records);
        self.send_payload_bytes(&body).await
    }

    /// Write bytes verbatim in pieces of at most `chunk` bytes, pausing
    /// briefly between pieces so the receiver sees partial reads.
    pub async fn send_bytes_chunked(
        &mut self,
        bytes: &[u8],
        chunk: usize,
    ) -> Result<(), Box<dyn std::error::Error>> {
        for piece in bytes.chunks(chunk.max(1)) {
            self.stream.write_all(piece).await?;
            self.stream.flush().await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Send the zero-length end-of-stream marker.
    pub async fn send_end(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.stream.write_all(&0u32.to_le_bytes()).await?;
        Ok(())
    }

    /// True if the peer closed the connection within `wait`.
    ///
    /// The ingestor never writes to sensors, so any successful read of zero
    /// bytes or a reset means the far side is gone.
    pub async fn peer_closed(&mut self, wait: Duration) -> bool {
        let mut buf = [0u8; 1];
        match tokio::time::timeout(wait, self.stream.read(&mut buf)).await {
            Ok(Ok(0) | Err(_)) => true,
            Ok(Ok(_)) | Err(_) => false,
        }
    }
}
