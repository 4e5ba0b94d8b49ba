//! Transport layer abstraction.

use crate::error::SessionResult;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Opens connections to the remote authority.
///
/// This trait abstracts the network layer; the session only ever sees a
/// pair of byte-frame channels, so any framed transport (a socket, a
/// websocket, the in-process [`LoopbackAuthority`](crate::LoopbackAuthority))
/// can sit behind it.
#[async_trait]
pub trait RemoteTransport: Send + Sync + 'static {
    /// Opens a fresh connection.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Transport`](crate::SessionError::Transport)
    /// if the authority cannot be reached.
    async fn connect(&self) -> SessionResult<Connection>;
}

/// One open connection: frames out, frames in.
///
/// The connection is lost when `inbound` yields `None` or a send on
/// `outbound` fails.
#[derive(Debug)]
pub struct Connection {
    /// Frames to the other side.
    pub outbound: mpsc::Sender<Vec<u8>>,
    /// Frames from the other side.
    pub inbound: mpsc::Receiver<Vec<u8>>,
}

impl Connection {
    /// Creates two connected ends.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            Self {
                outbound: a_tx,
                inbound: b_rx,
            },
            Self {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_is_crossed() {
        let (mut client, mut server) = Connection::pair(4);
        client.outbound.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(server.inbound.recv().await.unwrap(), b"hello");
        server.outbound.send(b"welcome".to_vec()).await.unwrap();
        assert_eq!(client.inbound.recv().await.unwrap(), b"welcome");
    }

    #[tokio::test]
    async fn dropping_one_end_closes_the_other() {
        let (mut client, server) = Connection::pair(4);
        drop(server);
        assert!(client.inbound.recv().await.is_none());
        assert!(client.outbound.send(vec![1]).await.is_err());
    }
}
