//! Line client for the relay.
//!
//! Performs the identity handshake and reads the relay's envelope+payload pairs back
//! as [`ChatMessage`]s.

use encoding_rs::Encoding;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::relay::codec;
use crate::relay::{ConnectionId, Language};

/// Error returned by client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to relay: {0}")]
    Connect(#[source] std::io::Error),

    #[error("communication error: {0}")]
    Io(#[from] std::io::Error),

    #[error("relay did not assign an identity")]
    Handshake,
}

/// One message received from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub from: ConnectionId,
    pub text: String,
}

/// Who a message came from, relative to this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    Me,
    Server,
    Participant(ConnectionId),
}

impl Speaker {
    pub fn of(own: ConnectionId, from: ConnectionId) -> Self {
        if from == own {
            Self::Me
        } else if from.is_system() {
            Self::Server
        } else {
            Self::Participant(from)
        }
    }

    pub fn label(self, language: Language) -> String {
        match self {
            Self::Me => language.label_me().to_string(),
            Self::Server => language.label_server().to_string(),
            Self::Participant(id) => language.label_participant(id),
        }
    }
}

pub struct ChatReader {
    inner: BufReader<OwnedReadHalf>,
    encoding: &'static Encoding,
    buf: Vec<u8>,
}

impl ChatReader {
    /// Next raw line, or `None` once the relay closed the connection.
    pub async fn next_line(&mut self) -> Result<Option<String>, ClientError> {
        self.buf.clear();
        let read = self.inner.read_until(b'\n', &mut self.buf).await?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(codec::decode_line(self.encoding, &self.buf)))
    }

    /// Next envelope+payload pair, or `None` once the relay closed the connection.
    pub async fn next_message(&mut self) -> Result<Option<ChatMessage>, ClientError> {
        loop {
            let Some(line) = self.next_line().await? else {
                return Ok(None);
            };

            let Some(from) = codec::parse_envelope(&line) else {
                debug!(line = %line, "Skipping line outside an envelope");
                continue;
            };

            let text = self.next_line().await?.unwrap_or_default();
            return Ok(Some(ChatMessage { from, text }));
        }
    }
}

pub struct ChatWriter {
    inner: OwnedWriteHalf,
    encoding: &'static Encoding,
}

impl ChatWriter {
    /// Send one line. Blank lines are not sent.
    pub async fn send(&mut self, line: &str) -> Result<(), ClientError> {
        if line.trim().is_empty() {
            return Ok(());
        }
        self.inner
            .write_all(&codec::encode_line(self.encoding, line))
            .await?;
        Ok(())
    }

    /// Close the sending direction; the relay sees EOF.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// A connected client that knows its own identity.
pub struct ChatClient {
    id: ConnectionId,
    reader: ChatReader,
    writer: ChatWriter,
}

impl ChatClient {
    /// Connect and wait for the relay to assign an identity.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        encoding: &'static Encoding,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(ClientError::Connect)?;
        let (read_half, write_half) = stream.into_split();

        let mut reader = ChatReader {
            inner: BufReader::new(read_half),
            encoding,
            buf: Vec::new(),
        };

        // The first envelope names our own identity; its payload line is empty.
        let id = loop {
            let Some(line) = reader.next_line().await? else {
                return Err(ClientError::Handshake);
            };
            if let Some(id) = codec::parse_envelope(&line) {
                break id;
            }
        };
        if id.is_system() {
            return Err(ClientError::Handshake);
        }
        reader.next_line().await?;

        Ok(Self {
            id,
            reader,
            writer: ChatWriter {
                inner: write_half,
                encoding,
            },
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn send(&mut self, line: &str) -> Result<(), ClientError> {
        self.writer.send(line).await
    }

    pub async fn next_message(&mut self) -> Result<Option<ChatMessage>, ClientError> {
        self.reader.next_message().await
    }

    pub fn into_split(self) -> (ConnectionId, ChatReader, ChatWriter) {
        (self.id, self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speaker_classification() {
        let me = ConnectionId::new(3);
        assert_eq!(Speaker::of(me, me), Speaker::Me);
        assert_eq!(Speaker::of(me, ConnectionId::SYSTEM), Speaker::Server);
        assert_eq!(
            Speaker::of(me, ConnectionId::new(4)),
            Speaker::Participant(ConnectionId::new(4))
        );
    }

    #[test]
    fn test_speaker_labels() {
        assert_eq!(Speaker::Me.label(Language::English), "You:");
        assert_eq!(Speaker::Server.label(Language::Russian), "Сервер:");
        assert_eq!(
            Speaker::Participant(ConnectionId::new(7)).label(Language::Russian),
            "Участник №7:"
        );
    }
}
