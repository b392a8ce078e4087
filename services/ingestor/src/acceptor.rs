//! Connection acceptor.
//!
//! Owns the listening socket and spawns one handler task per accepted
//! connection.  The accept wait is bounded by the idle timeout so the stop
//! signal is checked at least once per interval.  On stop the listener is
//! closed first, then every running handler is awaited.

use crate::buffer::IngestBuffer;
use crate::handler::{ConnectionSettings, handle_connection};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptorSummary {
    pub connections: u64,
    pub records: u64,
    pub rejected: u64,
}

pub struct Acceptor {
    listener: TcpListener,
    buffer: IngestBuffer,
    settings: ConnectionSettings,
    shutdown: watch::Receiver<bool>,
}

impl Acceptor {
    /// Bind the listening socket.  Failure here is fatal to the service and
    /// is never retried.
    pub async fn bind(
        addr: &str,
        buffer: IngestBuffer,
        settings: ConnectionSettings,
        shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Acceptor {
            listener,
            buffer,
            settings,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until stop is requested, then wait for every
    /// handler to finish.
    pub async fn run(mut self) -> AcceptorSummary {
        let mut handlers = JoinSet::new();
        let mut summary = AcceptorSummary::default();

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            tokio::select! {
                res = timeout(self.settings.idle_timeout, self.listener.accept()) => match res {
                    Err(_) => debug!("no connection before timeout"),
                    Ok(Ok((stream, peer))) => {
                        summary.connections += 1;
                        handlers.spawn(handle_connection(
                            stream,
                            peer,
                            self.buffer.clone(),
                            self.settings,
                            self.shutdown.clone(),
                        ));
                    }
                    Ok(Err(e)) => warn!(error = %e, "error waiting for connection"),
                },
                changed = self.shutdown.changed() => {
                    // The service dropped its stop sender.
                    if changed.is_err() {
                        break;
                    }
                }
            }

            while let Some(done) = handlers.try_join_next() {
                collect(&mut summary, done);
            }
        }

        drop(self.listener);
        debug!(active = handlers.len(), "listener closed; waiting for connections");
        while let Some(done) = handlers.join_next().await {
            collect(&mut summary, done);
        }
        info!(
            connections = summary.connections,
            records = summary.records,
            rejected = summary.rejected,
            "acceptor stopped"
        );
        summary
    }
}

fn collect(
    summary: &mut AcceptorSummary,
    done: Result<crate::handler::ConnectionSummary, tokio::task::JoinError>,
) {
    match done {
        Ok(conn) => {
            summary.records += conn.records;
            summary.rejected += conn.rejected;
        }
        Err(e) => warn!(error = %e, "connection handler failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fm_protocol::encode_frame;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            idle_timeout: Duration::from_millis(50),
            max_frame_bytes: 4096,
        }
    }

    #[tokio::test]
    async fn bind_collision_is_an_error() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let first = Acceptor::bind("127.0.0.1:0", IngestBuffer::new(), settings(), stop_rx.clone())
            .await
            .unwrap();
        let addr = first.local_addr().unwrap().to_string();
        let second = Acceptor::bind(&addr, IngestBuffer::new(), settings(), stop_rx).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn run_returns_after_stop_and_joins_handlers() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let buffer = IngestBuffer::new();
        let acceptor = Acceptor::bind("127.0.0.1:0", buffer.clone(), settings(), stop_rx)
            .await
            .unwrap();
        let addr = acceptor.local_addr().unwrap();
        let task = tokio::spawn(acceptor.run());

        // An idle connection that never closes on its own.
        let mut idle = TcpStream::connect(addr).await.unwrap();
        idle.write_all(&encode_frame(br#"{"timestamp":"t","temp":1,"rh":2}"#).unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        stop_tx.send(true).unwrap();
        let summary = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("acceptor should stop")
            .unwrap();

        assert_eq!(summary.connections, 1);
        assert_eq!(summary.records, 1);
        assert_eq!(buffer.len().await, 1);
        assert!(TcpStream::connect(addr).await.is_err(), "listener must be closed");
    }
}
