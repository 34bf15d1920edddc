use std::io::ErrorKind;
use std::net::TcpStream;

use anyhow::{anyhow, Context, Result};
use tungstenite::{Message, WebSocket};

use crate::session::ClientChannel;

/// `ClientChannel` over an accepted WebSocket.
///
/// The socket's read timeout bounds how long `recv_text` waits; a timeout is
/// reported as "no command". Pings are answered by tungstenite on the next
/// read or write.
pub(crate) struct WsChannel {
    socket: WebSocket<TcpStream>,
}

impl WsChannel {
    pub fn new(socket: WebSocket<TcpStream>) -> Self {
        Self { socket }
    }
}

impl ClientChannel for WsChannel {
    fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.socket
            .send(Message::Binary(data.to_vec()))
            .context("send frame")
    }

    fn send_text(&mut self, text: &str) -> Result<()> {
        self.socket
            .send(Message::Text(text.to_string()))
            .context("send text")
    }

    fn recv_text(&mut self) -> Result<Option<String>> {
        match self.socket.read() {
            Ok(Message::Text(text)) => Ok(Some(text)),
            Ok(Message::Close(_)) => Err(anyhow!("client closed the connection")),
            Ok(Message::Binary(data)) => {
                log::debug!("ignoring {} byte binary message from client", data.len());
                Ok(None)
            }
            Ok(_) => Ok(None),
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                Ok(None)
            }
            Err(err) => Err(anyhow::Error::new(err).context("receive from client")),
        }
    }

    fn close(&mut self) {
        if self.socket.close(None).is_ok() {
            let _ = self.socket.flush();
        }
    }
}
