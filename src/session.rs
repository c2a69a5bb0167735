//! Per-connection command loop
//!
//! ```text
//! Unauthenticated --HANDSHAKE ok--------------> Authenticated
//! Unauthenticated --HANDSHAKE bad-------------> Closed
//! Unauthenticated --other, skip disallowed----> Closed
//! Unauthenticated --other, skip allowed-------> Authenticated
//! Authenticated   --ADD_FILE (ACK | NACK)-----> Authenticated
//! *               --CLOSE---------------------> Closed
//! ```
//!
//! Messages are handled strictly one at a time.

use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{perform_handshake, CredentialStore};
use crate::error::BackupError;
use crate::ingest::Ingestor;
use crate::object_stream::ObjectStream;
use crate::protocol::{AddFile, Credentials, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Authenticated,
    Closed,
}

pub struct ConnectionContext {
    pub id: Uuid,
    pub peer: String,
    pub stream: Arc<ObjectStream>,
    pub authenticated: bool,
    pub closed: bool,
}

impl ConnectionContext {
    pub fn new(peer: String, stream: Arc<ObjectStream>) -> Self {
        ConnectionContext {
            id: Uuid::new_v4(),
            peer,
            stream,
            authenticated: false,
            closed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        if self.closed {
            ConnectionState::Closed
        } else if self.authenticated {
            ConnectionState::Authenticated
        } else {
            ConnectionState::Unauthenticated
        }
    }
}

/// Server-wide collaborators handed to every session
#[derive(Clone)]
pub struct Services {
    /// Asserted back to clients after a valid handshake
    pub identity: Credentials,
    pub credentials: Arc<dyn CredentialStore>,
    pub ingestor: Arc<Ingestor>,
    pub allow_skipped_handshake: bool,
}

enum Flow {
    Continue,
    Stop,
}

pub struct Session {
    ctx: ConnectionContext,
    services: Arc<Services>,
}

impl Session {
    pub fn new(ctx: ConnectionContext, services: Arc<Services>) -> Self {
        Session { ctx, services }
    }

    /// Serve the connection until `CLOSE`, a fatal error or peer hangup.
    /// The stream is closed on return.
    pub async fn run(mut self) -> ConnectionContext {
        match self.drive().await {
            Ok(()) => debug!(conn = %self.ctx.id, "peer sent CLOSE"),
            Err(BackupError::Closed) => debug!(conn = %self.ctx.id, "peer went away"),
            Err(e) if e.is_fatal() => info!(conn = %self.ctx.id, error = %e, "connection ended"),
            Err(e) => warn!(conn = %self.ctx.id, error = %e, "connection terminated"),
        }
        self.ctx.closed = true;
        self.ctx.stream.close().await;
        self.ctx
    }

    async fn drive(&mut self) -> Result<(), BackupError> {
        loop {
            let incoming = match self.ctx.stream.receive_message().await {
                Ok(value) => Message::from_value(value),
                // Framing is intact after a bad payload, so the loop can go on
                Err(e @ BackupError::Parse(_)) => Err(e),
                Err(e) => return Err(e),
            };
            if let Flow::Stop = self.step(incoming).await? {
                return Ok(());
            }
        }
    }

    async fn step(&mut self, incoming: Result<Message, BackupError>) -> Result<Flow, BackupError> {
        match &incoming {
            Ok(Message::Close) => return Ok(Flow::Stop),
            Ok(Message::Handshake(presented)) => {
                self.handshake(presented).await?;
                return Ok(Flow::Continue);
            }
            _ => {}
        }

        self.require_authentication().await?;

        match incoming {
            Ok(Message::AddFile(req)) => self.add_file(&req).await?,
            Ok(other) => {
                self.nack(format!("unexpected command {}", other.command()))
                    .await?
            }
            Err(e) => {
                debug!(conn = %self.ctx.id, error = %e, "bad message");
                self.nack(e.to_string()).await?
            }
        }
        Ok(Flow::Continue)
    }

    async fn handshake(&mut self, presented: &Credentials) -> Result<(), BackupError> {
        let services = Arc::clone(&self.services);
        let result = perform_handshake(
            &mut self.ctx,
            services.credentials.as_ref(),
            &services.identity,
            presented,
        )
        .await;

        if let Err(e) = result {
            self.ctx.authenticated = false;
            // Best effort so the client is not left waiting on a dead connection
            let _ = self.nack(e.to_string()).await;
            return Err(match e {
                e @ BackupError::Authentication(_) => e,
                other => BackupError::Authentication(other.to_string()),
            });
        }
        Ok(())
    }

    async fn require_authentication(&mut self) -> Result<(), BackupError> {
        if self.ctx.authenticated {
            return Ok(());
        }
        if self.services.allow_skipped_handshake {
            debug!(conn = %self.ctx.id, "handshake skipped");
            self.ctx.authenticated = true;
            return Ok(());
        }
        let _ = self.nack("handshake required").await;
        Err(BackupError::Authentication("command before handshake".into()))
    }

    async fn add_file(&mut self, req: &AddFile) -> Result<(), BackupError> {
        match self.services.ingestor.ingest(req).await {
            Ok(_) => self.ctx.stream.send_message(&Message::Ack).await,
            Err(e) => self.nack(e.to_string()).await,
        }
    }

    async fn nack(&self, msg: impl Into<String>) -> Result<(), BackupError> {
        self.ctx.stream.send_message(&Message::nack(msg)).await
    }
}
