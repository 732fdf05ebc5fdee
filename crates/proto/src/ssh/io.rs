//! Socket write side.
//!
//! The session loop never awaits a socket write. Encoded packets are handed
//! to a writer task through an unbounded queue and each write reports its
//! outcome on a [`WriteFuture`]. Writes complete in submission order; after
//! the first failure every queued and later write fails with the same error.

use crate::ssh::future::WriteFuture;
use bytes::Bytes;
use fjord_platform::FjordError;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

enum WriteOp {
    Data(Bytes, WriteFuture),
    Shutdown,
}

/// Handle to the writer task of one connection.
#[derive(Debug)]
pub(crate) struct IoWriter {
    tx: Option<mpsc::UnboundedSender<WriteOp>>,
    task: Option<JoinHandle<()>>,
}

impl IoWriter {
    /// Spawns the writer task over `stream`.
    pub(crate) fn spawn<W>(mut stream: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteOp>();
        let task = tokio::spawn(async move {
            let mut failure: Option<FjordError> = None;
            while let Some(op) = rx.recv().await {
                match op {
                    WriteOp::Data(data, future) => {
                        if let Some(err) = &failure {
                            future.set_value(Err(err.clone()));
                            continue;
                        }
                        let len = data.len();
                        match stream.write_all(&data).await {
                            Ok(()) => {
                                trace!("Wrote {} bytes", len);
                                future.set_value(Ok(len));
                            }
                            Err(e) => {
                                debug!("Socket write failed: {}", e);
                                let err = FjordError::Io(e);
                                future.set_value(Err(err.clone()));
                                failure = Some(err);
                            }
                        }
                    }
                    WriteOp::Shutdown => break,
                }
            }
            // best effort, the peer may already be gone
            let _ = stream.flush().await;
            let _ = stream.shutdown().await;
            while let Ok(WriteOp::Data(_, future)) = rx.try_recv() {
                future.set_value(Err(FjordError::Closed("Connection closed".to_string())));
            }
        });
        Self {
            tx: Some(tx),
            task: Some(task),
        }
    }

    /// Queues bytes for writing.
    pub(crate) fn write(&self, data: Bytes) -> WriteFuture {
        let future = WriteFuture::new("write");
        self.write_with(data, future.clone());
        future
    }

    /// Queues bytes and completes `future` once written.
    pub(crate) fn write_with(&self, data: Bytes, future: WriteFuture) {
        let sent = match &self.tx {
            Some(tx) => tx.send(WriteOp::Data(data, future.clone())).is_ok(),
            None => false,
        };
        if !sent {
            future.set_value(Err(FjordError::Closed("Connection closed".to_string())));
        }
    }

    /// Flushes queued writes and closes the socket. Idempotent.
    pub(crate) fn shutdown(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(WriteOp::Shutdown);
        }
    }

    /// Waits for the writer task to finish.
    pub(crate) async fn join(&mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for IoWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_writes_in_order() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut writer = IoWriter::spawn(a);

        let f1 = writer.write(Bytes::from_static(b"hello "));
        let f2 = writer.write(Bytes::from_static(b"world"));
        assert_eq!(f2.verify(Some(Duration::from_secs(1))).await.unwrap(), 5);
        assert_eq!(f1.peek().unwrap().unwrap(), 6);

        writer.join().await;
        let mut out = Vec::new();
        b.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_write_after_shutdown_fails() {
        let (a, _b) = tokio::io::duplex(64);
        let mut writer = IoWriter::spawn(a);
        writer.shutdown();
        let f = writer.write(Bytes::from_static(b"late"));
        assert!(matches!(f.peek(), Some(Err(FjordError::Closed(_)))));
    }
}
