//! The relay server: listener, live-connection table, admin slot and routing.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use super::admin::{AdminSlot, Claim};
use super::codec::{self, Command};
use super::connection::{CloseHook, Connection, LineHandler};
use super::identity::ConnectionId;
use crate::context::AppContext;
use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Running,
    Closing,
    Closed,
}

/// Owns every live connection and routes lines between them.
pub struct Registry {
    ctx: AppContext,
    connections: Arc<DashMap<ConnectionId, Arc<Connection>>>,
    admin: Arc<AdminSlot>,
    state: Mutex<ServerState>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Registry {
    pub fn new(ctx: AppContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            connections: Arc::new(DashMap::new()),
            admin: Arc::new(AdminSlot::new()),
            state: Mutex::new(ServerState::Idle),
            local_addr: Mutex::new(None),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ServerState {
        *self.lock_state()
    }

    /// Address the listener is bound to, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn lookup(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Current admin identity, if any.
    pub fn admin(&self) -> Option<ConnectionId> {
        self.admin.holder()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn start(self: &Arc<Self>) -> Result<(), RelayError> {
        let state = self.state();
        if state != ServerState::Idle {
            return Err(RelayError::NotStartable(state));
        }

        let addr = self.ctx.config.listen_addr();
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                error!(addr = %addr, error = %source, "Failed to bind listener");
                self.shutdown().await;
                return Err(RelayError::Bind { addr, source });
            }
        };

        self.serve(listener).await
    }

    /// Accept connections on `listener` until [`Registry::shutdown`] is called.
    ///
    /// Returns `Ok` when stopped by shutdown. An unexpected accept error shuts the relay
    /// down and is returned.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), RelayError> {
        {
            let mut state = self.lock_state();
            if *state != ServerState::Idle {
                return Err(RelayError::NotStartable(*state));
            }
            *state = ServerState::Running;
        }

        let local_addr = listener.local_addr().ok();
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = local_addr;
        if let Some(addr) = local_addr {
            info!(addr = %addr, "Relay listening");
        }

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Listener closed");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = self.admit(stream, peer) {
                            error!(error = %e, "Relay cannot continue");
                            self.shutdown().await;
                            return Err(e);
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        self.shutdown().await;
                        return Err(RelayError::Accept(e));
                    }
                }
            }
        }

        Ok(())
    }

    /// Register an accepted stream and start its tasks. Never waits on any peer.
    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<(), RelayError> {
        let id = self.ctx.ids.next();
        if id.is_system() {
            return Err(RelayError::ReservedIdentity(id));
        }

        let (connection, reader, write_loop) = Connection::new(
            id,
            peer,
            stream,
            self.ctx.encoding,
            self.shutdown.child_token(),
            self.close_hook(),
        );
        self.connections.insert(id, Arc::clone(&connection));
        info!(conn = %id, peer = %peer, "Connection established");

        let handler: Arc<dyn LineHandler> = Arc::clone(self) as Arc<dyn LineHandler>;
        self.tasks.spawn(write_loop.run());
        self.tasks.spawn(Arc::clone(&connection).receive_loop(reader, handler));

        if self.shutdown.is_cancelled() {
            connection.close();
            return Ok(());
        }

        self.welcome(&connection);
        Ok(())
    }

    /// Removes the closed connection from the table and frees the admin slot it held.
    fn close_hook(&self) -> CloseHook {
        let connections = Arc::clone(&self.connections);
        let admin = Arc::clone(&self.admin);

        Box::new(move |id| {
            connections.remove(&id);
            if admin.release(id) {
                info!(conn = %id, "Admin slot cleared");
            }
            info!(conn = %id, "Closed connection removed from registry");
        })
    }

    fn welcome(&self, connection: &Connection) {
        let id = connection.id();
        let lang = self.ctx.language;

        connection.send(&codec::sign(id, ""));
        connection.send(&codec::sign(ConnectionId::SYSTEM, &lang.welcome(id)));
        self.broadcast(None, &lang.joined(id), id);
    }

    /// Route one inbound line from `sender`.
    pub fn dispatch(&self, sender: &Connection, raw: &str) {
        let id = sender.id();
        let privileged = self.admin.is_held_by(id);

        match Command::parse(raw, privileged) {
            Command::Quit => self.quit(sender),
            Command::Kick { target, .. } => self.kick(target, sender),
            Command::ClaimAdmin if privileged => {}
            Command::ClaimAdmin => self.grant_admin(sender),
            Command::Direct { target, body } => self.send_to(target, Some(sender), &body),
            Command::Broadcast(body) => self.broadcast(Some(sender), body, id),
        }
    }

    /// Send `message`, attributed to `sender` (or the relay), to every connection but
    /// `exclude`.
    pub fn broadcast(&self, sender: Option<&Connection>, message: &str, exclude: ConnectionId) {
        let from = sender.map_or(ConnectionId::SYSTEM, Connection::id);
        let signed = codec::sign(from, message);

        let recipients = self.snapshot(exclude);
        for connection in &recipients {
            connection.send(&signed);
        }

        info!(from = %from, recipients = recipients.len(), text = message, "Broadcast");
    }

    /// Deliver `message` to `target` only; tells `sender` when there is no such target.
    pub fn send_to(&self, target: ConnectionId, sender: Option<&Connection>, message: &str) {
        let Some(recipient) = self.lookup(target) else {
            if let Some(sender) = sender {
                let notice = self.ctx.language.no_such_participant();
                sender.send(&codec::sign(ConnectionId::SYSTEM, notice));
            }
            return;
        };

        let from = sender.map_or(ConnectionId::SYSTEM, Connection::id);
        debug!(from = %from, to = %target, "Direct message");
        recipient.send(&codec::sign(from, message));
    }

    fn quit(&self, connection: &Connection) {
        let lang = self.ctx.language;

        connection.send(&codec::sign(ConnectionId::SYSTEM, lang.farewell()));
        connection.close();
        self.broadcast(None, &lang.left(connection.id()), ConnectionId::SYSTEM);
    }

    fn kick(&self, target: ConnectionId, admin: &Connection) {
        let lang = self.ctx.language;

        let Some(victim) = self.lookup(target) else {
            admin.send(&codec::sign(ConnectionId::SYSTEM, lang.no_such_participant()));
            return;
        };

        info!(admin = %admin.id(), conn = %target, "Kicking participant");
        victim.send(&codec::sign(ConnectionId::SYSTEM, lang.kicked()));
        victim.close();
    }

    fn grant_admin(&self, connection: &Connection) {
        match self.admin.claim(connection.id()) {
            Claim::AlreadyHeld => {}
            Claim::Granted { replaced } => {
                info!(conn = %connection.id(), replaced = ?replaced, "Admin granted");
                let notice = self.ctx.language.admin_granted();
                connection.send(&codec::sign(ConnectionId::SYSTEM, notice));
            }
        }
    }

    fn snapshot(&self, exclude: ConnectionId) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| *entry.key() != exclude)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Stop accepting, close every live connection and wait for its tasks to finish.
    ///
    /// Queued messages are discarded, so a peer that stopped reading cannot hold this up.
    /// Idempotent; later and concurrent callers return immediately.
    pub async fn shutdown(&self) {
        {
            let mut state = self.lock_state();
            match *state {
                ServerState::Closing | ServerState::Closed => return,
                ServerState::Idle | ServerState::Running => *state = ServerState::Closing,
            }
        }

        info!("Relay shutting down");
        self.shutdown.cancel();

        for connection in self.snapshot(ConnectionId::SYSTEM) {
            connection.close();
        }

        self.tasks.close();
        self.tasks.wait().await;

        *self.lock_state() = ServerState::Closed;
        info!("Relay closed");
    }
}

#[async_trait]
impl LineHandler for Registry {
    async fn handle_line(&self, connection: &Arc<Connection>, line: String) {
        self.dispatch(connection, &line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn registry() -> Arc<Registry> {
        let ctx = AppContext::new(AppConfig::default()).unwrap();
        Registry::new(ctx)
    }

    #[tokio::test]
    async fn test_shutdown_before_serve_closes_registry() {
        let registry = registry();
        assert_eq!(registry.state(), ServerState::Idle);

        registry.shutdown().await;
        assert_eq!(registry.state(), ServerState::Closed);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let result = registry.serve(listener).await;
        assert!(matches!(
            result,
            Err(RelayError::NotStartable(ServerState::Closed))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let registry = registry();
        tokio::join!(registry.shutdown(), registry.shutdown());
        registry.shutdown().await;
        assert_eq!(registry.state(), ServerState::Closed);
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_identity_lookup() {
        let registry = registry();
        assert!(!registry.contains(ConnectionId::new(1)));
        assert!(registry.lookup(ConnectionId::new(1)).is_none());
        assert_eq!(registry.admin(), None);
    }
}
