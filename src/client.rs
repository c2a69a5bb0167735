//! Client side of the object protocol

use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::BackupError;
use crate::object_stream::ObjectStream;
use crate::protocol::{command, timeouts, AddFile, Credentials, Message};

/// The server's own `{username, secretkey}` assertion
pub type ServerIdentity = Credentials;

pub struct BackupClient {
    stream: ObjectStream,
    reply_timeout: Duration,
}

impl BackupClient {
    pub async fn connect(host: &str, port: u16) -> Result<Self, BackupError> {
        let addr = format!("{host}:{port}");
        let socket = tokio::time::timeout(
            Duration::from_millis(timeouts::CONNECT_MS),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| timed_out(format!("connect to {addr}")))??;
        let _ = socket.set_nodelay(true);
        debug!(%addr, "connected");
        Ok(Self::from_stream(socket))
    }

    pub fn from_stream<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        BackupClient {
            stream: ObjectStream::new(io),
            reply_timeout: Duration::from_millis(timeouts::REPLY_MS),
        }
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    /// Send `msg` and wait for its reply. A timeout closes the connection:
    /// the late reply would otherwise answer the next request.
    async fn request(&self, msg: &Message) -> Result<Value, BackupError> {
        self.stream.send_message(msg).await?;
        match tokio::time::timeout(self.reply_timeout, self.stream.receive_message()).await {
            Ok(reply) => reply,
            Err(_) => {
                self.stream.close().await;
                Err(timed_out(format!("reply to {}", msg.command())))
            }
        }
    }

    /// Present credentials. A `NACK` or anything that is not an identity
    /// assertion is an authentication failure.
    pub async fn handshake(
        &self,
        username: &str,
        secretkey: &str,
    ) -> Result<ServerIdentity, BackupError> {
        let msg = Message::Handshake(Credentials {
            username: username.to_string(),
            secretkey: secretkey.to_string(),
        });
        let reply = self.request(&msg).await?;
        if reply.get("type").and_then(Value::as_str) == Some(command::NACK) {
            let reason = reply.get("msg").and_then(Value::as_str).unwrap_or("rejected");
            return Err(BackupError::Authentication(reason.to_string()));
        }
        serde_json::from_value(reply)
            .map_err(|e| BackupError::Authentication(format!("invalid server assertion: {e}")))
    }

    /// Ask the server to back up `client_path`, fetching content from `source_location`
    pub async fn add_file(
        &self,
        client_path: &str,
        owner_id: i64,
        source_location: &str,
    ) -> Result<(), BackupError> {
        let msg = Message::AddFile(AddFile {
            client_path: client_path.to_string(),
            owner_id,
            source_location: source_location.to_string(),
        });
        match Message::from_value(self.request(&msg).await?)? {
            Message::Ack => Ok(()),
            Message::Nack { msg } => Err(BackupError::Rejected(msg)),
            other => Err(BackupError::Protocol(format!(
                "unexpected reply {}",
                other.command()
            ))),
        }
    }

    /// Send `CLOSE` and release the connection
    pub async fn close(self) -> Result<(), BackupError> {
        let sent = self.stream.send_message(&Message::Close).await;
        self.stream.close().await;
        sent
    }
}

fn timed_out(what: String) -> BackupError {
    BackupError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{what} timed out"),
    ))
}
