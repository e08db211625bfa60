// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory pipe listener for transport tests.
//!
//! A [`Pipe`] is a synchronous rendezvous point: [`Pipe::accept`] and
//! [`Pipe::connect`] block until a peer arrives on the other side, then both
//! return one half of a freshly created bidirectional byte stream. There is
//! no buffering of pending connections beyond a small handoff queue, which
//! keeps test transports honest about connection ordering.

#![deny(missing_docs)]

use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// Buffer size of each direction of an established pipe connection.
const CONNECTION_BUFFER_BYTES: usize = 64 * 1024;

/// Number of connect attempts that may be parked waiting for an accept.
const HANDOFF_QUEUE_DEPTH: usize = 16;

/// Errors returned by [`Pipe`] operations.
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    /// The supplied cancellation token fired before the rendezvous happened.
    #[error("pipe operation canceled")]
    Canceled,

    /// The listener was dropped while the peer was waiting.
    #[error("pipe listener closed")]
    Closed,
}

type ConnectRequest = oneshot::Sender<DuplexStream>;

/// A synchronous in-memory connection rendezvous.
///
/// Cloning is intentionally not provided; share a `Pipe` behind an `Arc` the
/// same way a real listener socket would be shared.
pub struct Pipe {
    connect_tx: mpsc::Sender<ConnectRequest>,
    accept_rx: Mutex<mpsc::Receiver<ConnectRequest>>,
}

impl Pipe {
    /// Create a new pipe listener with no parked peers.
    pub fn new() -> Self {
        let (connect_tx, accept_rx) = mpsc::channel(HANDOFF_QUEUE_DEPTH);
        Self {
            connect_tx,
            accept_rx: Mutex::new(accept_rx),
        }
    }

    /// Wait for a peer to connect and return the server half of the stream.
    ///
    /// Returns [`PipeError::Canceled`] if `cancel` fires before a peer
    /// arrives, including when it is already cancelled on entry.
    pub async fn accept(&self, cancel: &CancellationToken) -> Result<DuplexStream, PipeError> {
        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipeError::Canceled),
            guard = self.accept_rx.lock() => guard,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipeError::Canceled),
            req = rx.recv() => {
                let req = req.ok_or(PipeError::Closed)?;
                let (server, client) = tokio::io::duplex(CONNECTION_BUFFER_BYTES);
                // A connector that gave up between send and handoff just
                // loses the connection; the acceptor keeps its half and the
                // stream reads EOF.
                let _ = req.send(client);
                Ok(server)
            }
        }
    }

    /// Connect to the listener and return the client half of the stream.
    ///
    /// Blocks until an [`accept`](Self::accept) picks this attempt up.
    /// Returns [`PipeError::Canceled`] if `cancel` fires first.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<DuplexStream, PipeError> {
        if cancel.is_cancelled() {
            return Err(PipeError::Canceled);
        }

        let (tx, rx) = oneshot::channel();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipeError::Canceled),
            sent = self.connect_tx.send(tx) => {
                sent.map_err(|_| PipeError::Closed)?;
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipeError::Canceled),
            stream = rx => stream.map_err(|_| PipeError::Closed),
        }
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_pipe_accept() {
        let listener = Arc::new(Pipe::new());
        let cancel = CancellationToken::new();

        let server = {
            let listener = listener.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { listener.accept(&cancel).await })
        };

        let mut client = listener.connect(&cancel).await.expect("connect");
        let mut server = server.await.expect("join").expect("accept");

        client.write_all(b"ping").await.expect("write");
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_pipe_client_canceled() {
        let listener = Pipe::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = listener.connect(&cancel).await.unwrap_err();
        assert!(matches!(err, PipeError::Canceled));
    }

    #[tokio::test]
    async fn test_pipe_server_canceled() {
        let listener = Pipe::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = listener.accept(&cancel).await.unwrap_err();
        assert!(matches!(err, PipeError::Canceled));
    }

    #[tokio::test]
    async fn test_pipe_connect_then_cancel_releases_waiter() {
        let listener = Pipe::new();
        let cancel = CancellationToken::new();

        let pending = {
            let cancel = cancel.clone();
            async move { listener.connect(&cancel).await }
        };
        let pending = tokio::spawn(pending);

        tokio::task::yield_now().await;
        cancel.cancel();

        let err = pending.await.expect("join").unwrap_err();
        assert!(matches!(err, PipeError::Canceled));
    }
}
