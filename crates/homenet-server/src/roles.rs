//! The role server: four TCP listeners, two of them TLS-terminated.
//!
//! Each accepted socket becomes one conversation task. Accept loops never
//! block on anything but `accept`; TLS handshakes and all per-connection
//! work happen on the spawned task.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_native_tls::TlsAcceptor;

use crate::conversation::Conversation;
use crate::{Context, Result, ServerError};

/// The four TCP roles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Role advertisement, lightweight lookups, neighbor replication.
    Primary,
    /// ListRoles, lookups, and reduced-cap search without TLS.
    ClientNonTls,
    /// Full client conversations over TLS.
    ClientTls,
    /// Application-service relay over TLS.
    AppServiceTls,
}

impl Role {
    /// Whether connections on this role are TLS-terminated.
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::ClientTls | Self::AppServiceTls)
    }
}

/// One bound listener.
struct RoleListener {
    role: Role,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
}

/// The role server: all four listeners, bound and ready to accept.
pub struct RoleServer {
    listeners: Vec<RoleListener>,
}

impl RoleServer {
    /// Bind the four role listeners. `tls` is required unless every TLS
    /// role is disabled by the caller, which only tests do.
    pub async fn bind(ctx: &Context, tls: Option<TlsAcceptor>) -> Result<Self> {
        let ports = ctx.ports;
        let mut listeners = Vec::new();
        for (role, port) in [
            (Role::Primary, ports.primary),
            (Role::ClientNonTls, ports.client_non_tls),
            (Role::ClientTls, ports.client_tls),
            (Role::AppServiceTls, ports.app_service_tls),
        ] {
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let listener = TcpListener::bind(addr).await?;
            let tls = if role.is_tls() {
                match &tls {
                    Some(acceptor) => Some(acceptor.clone()),
                    None => {
                        return Err(ServerError::Tls(format!(
                            "role {role:?} requires a TLS acceptor"
                        )))
                    }
                }
            } else {
                None
            };
            tracing::info!(role = ?role, %addr, "role listener bound");
            listeners.push(RoleListener {
                role,
                listener,
                tls,
            });
        }
        Ok(Self { listeners })
    }

    /// Local address of a role's listener (useful with port 0 in tests).
    pub fn local_addr(&self, role: Role) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|l| l.role == role)
            .and_then(|l| l.listener.local_addr().ok())
    }

    /// Spawn one accept task per listener.
    pub fn spawn_accept_loops(self, ctx: Context) -> Vec<JoinHandle<()>> {
        self.listeners
            .into_iter()
            .map(|listener| {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    accept_loop(ctx, listener).await;
                })
            })
            .collect()
    }
}

async fn accept_loop(ctx: Context, role_listener: RoleListener) {
    let role = role_listener.role;
    let mut shutdown = ctx.shutdown.subscribe();

    loop {
        let accepted = tokio::select! {
            _ = shutdown.recv() => break,
            accepted = role_listener.listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer_addr)) => {
                if ctx.registry.len() >= ctx.limits.max_connections {
                    tracing::warn!(%peer_addr, "connection cap reached, dropping");
                    continue;
                }
                let ctx = Arc::clone(&ctx);
                let tls = role_listener.tls.clone();
                tokio::spawn(async move {
                    handle_connection(ctx, role, tls, stream, peer_addr).await;
                });
            }
            Err(e) => {
                tracing::error!(role = ?role, "accept failed: {e}");
            }
        }
    }
    tracing::info!(role = ?role, "role listener closed");
}

async fn handle_connection(
    ctx: Context,
    role: Role,
    tls: Option<TlsAcceptor>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) {
    let _ = stream.set_nodelay(true);
    let conversation = match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                Conversation::new(Arc::clone(&ctx), role, Box::new(tls_stream), peer_addr)
            }
            Err(e) => {
                tracing::debug!(%peer_addr, "TLS handshake failed: {e}");
                return;
            }
        },
        None => Conversation::new(Arc::clone(&ctx), role, Box::new(stream), peer_addr),
    };
    conversation.run().await;
}
