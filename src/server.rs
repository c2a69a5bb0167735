//! TCP accept loop: one session task per connection

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::BackupError;
use crate::object_stream::ObjectStream;
use crate::registry::ConnectionRegistry;
use crate::session::{ConnectionContext, Services, Session};

/// Pause after a failed accept so a persistent error (EMFILE) does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Server {
    listener: TcpListener,
    services: Arc<Services>,
    registry: Arc<ConnectionRegistry>,
}

impl Server {
    pub async fn bind(addr: &str, services: Services) -> Result<Self, BackupError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Server {
            listener,
            services: Arc::new(services),
            registry: Arc::new(ConnectionRegistry::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BackupError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accept connections until `shutdown` fires, then close every open
    /// connection and wait for its session to finish.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), BackupError> {
        info!(addr = %self.local_addr()?, "listening");
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => self.spawn_session(&mut sessions, socket, peer),
                    // Transient (EMFILE, aborted connection); keep listening
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "session task failed");
                    }
                }
            }
        }

        info!(open = self.registry.len(), "shutting down");
        self.registry.close_all().await;
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "session task failed");
            }
        }
        Ok(())
    }

    fn spawn_session(&self, sessions: &mut JoinSet<()>, socket: TcpStream, peer: SocketAddr) {
        let _ = socket.set_nodelay(true);
        let stream = Arc::new(ObjectStream::new(socket));
        let ctx = ConnectionContext::new(peer.to_string(), Arc::clone(&stream));
        let registration = self.registry.enroll(ctx.id, peer.to_string(), stream);
        info!(conn = %ctx.id, %peer, "connection opened");

        let services = Arc::clone(&self.services);
        sessions.spawn(async move {
            let ctx = Session::new(ctx, services).run().await;
            drop(registration);
            debug!(conn = %ctx.id, authenticated = ctx.authenticated, "connection released");
        });
    }
}
