use shared::ServerMessage;
use tokio::sync::mpsc;

/// Frames queued for a connection's socket writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Close,
}

/// Handle to a live connection
///
/// Cloning the handle is cheap; every clone feeds the same outbound queue.
/// Once the writer task has gone away, sends are silently dropped.
#[derive(Debug, Clone)]
pub struct Connection {
    id: u64,
    sender: mpsc::Sender<Outgoing>,
}

impl Connection {
    pub fn new(id: u64, sender: mpsc::Sender<Outgoing>) -> Self {
        Connection { id, sender }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    // Waits for queue space when the peer is slow
    pub async fn send(&self, message: &ServerMessage) {
        let _ = self.sender.send(Outgoing::Text(message.to_string())).await;
    }

    /// Sends a final message, then asks the writer to close the socket.
    pub async fn send_and_close(&self, message: &ServerMessage) {
        self.send(message).await;
        let _ = self.sender.send(Outgoing::Close).await;
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
