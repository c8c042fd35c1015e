//! homenet-daemon: the profile server process.
//!
//! Single OS process on a Tokio runtime. Startup is topological: config,
//! database, network keys, image store, TLS, role listeners, then the
//! replicator and maintenance tasks attach. Runs until SIGINT/SIGTERM;
//! exit code 0 on graceful shutdown, non-zero on fatal init failure.

mod config;
mod vacuum;

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{error, info};

use homenet_crypto::{KeyPair, NodeKeys};
use homenet_db::queries::settings;
use homenet_images::ImageStore;
use homenet_search::ResultCache;
use homenet_server::registry::Registry;
use homenet_server::roles::{Role, RoleServer};
use homenet_server::{RolePorts, ServerContext, ServerLimits};
use homenet_sync::{SyncConfig, SyncContext};

use crate::config::DaemonConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("homenet=info".parse()?),
        )
        .init();

    info!("homenet profile server starting");

    // 1. Configuration from the working directory.
    let config = DaemonConfig::load()?;

    // 2. Database.
    let conn = homenet_db::open(&config.db_file_name)?;

    // 3. Network identity keys, generated on first start.
    let keys = Arc::new(load_or_create_keys(&conn)?);
    info!(network_id = %keys.network_id, "network identity ready");

    // 4. Image blob store.
    let images = ImageStore::open(&config.image_data_folder).await?;

    // 5. TLS acceptor from the PKCS#12 bundle.
    let tls = homenet_server::tls::acceptor_from_pkcs12(
        &config.tls_server_certificate,
        &config.tls_certificate_password,
    )?;

    // 6. Shared infrastructure.
    let db = Arc::new(Mutex::new(conn));
    let (shutdown_tx, _) = broadcast::channel(1);
    let actions_changed = Arc::new(Notify::new());

    let server_ctx = Arc::new(ServerContext {
        db: Arc::clone(&db),
        images: images.clone(),
        keys: Arc::clone(&keys),
        limits: ServerLimits {
            max_hosted_identities: config.max_hosted_identities,
            max_neighbors: config.max_neighbors,
            max_followers: config.max_followers,
            max_connections: config.max_connections,
            hosting_retention_days: config.hosting_retention_days,
            ..ServerLimits::default()
        },
        ports: RolePorts {
            primary: config.primary_port,
            client_non_tls: config.client_non_customer_port,
            client_tls: config.client_customer_port,
            app_service_tls: config.client_app_service_port,
        },
        search_cache: std::sync::Mutex::new(ResultCache::new()),
        relationships: std::sync::Mutex::new(
            homenet_server::relationships::RelationshipStore::new(),
        ),
        registry: Registry::new(),
        actions_changed: Arc::clone(&actions_changed),
        shutdown: shutdown_tx.clone(),
    });

    let sync_ctx = Arc::new(SyncContext {
        db: Arc::clone(&db),
        images: images.clone(),
        keys: Arc::clone(&keys),
        actions_changed: Arc::clone(&actions_changed),
        shutdown: shutdown_tx.clone(),
        config: SyncConfig {
            loc_endpoint: config.loc_endpoint(),
            primary_port: config.primary_port,
            max_neighbors: config.max_neighbors,
            neighbor_expiration_secs: config.neighbor_expiration_hours * 3600,
        },
    });

    // 7. Role listeners.
    let role_server = RoleServer::bind(&server_ctx, Some(tls)).await?;
    if let Some(addr) = role_server.local_addr(Role::Primary) {
        info!(%addr, external = %config.external_server_address, "primary role ready");
    }
    let mut tasks = role_server.spawn_accept_loops(Arc::clone(&server_ctx));

    // 8. Replicator and maintenance tasks.
    tasks.push(homenet_sync::loc::spawn(Arc::clone(&sync_ctx)));
    tasks.push(homenet_sync::drainer::spawn(Arc::clone(&sync_ctx)));
    tasks.push(vacuum::spawn(
        Arc::clone(&sync_ctx),
        config.hosting_retention_days,
    ));

    info!("profile server running");

    // 9. Run until a termination signal arrives.
    wait_for_signal().await;
    info!("shutdown signal received");

    // 10. Fan out the shutdown token and let the tasks drain.
    let _ = shutdown_tx.send(());
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(std::time::Duration::from_secs(30), drain)
        .await
        .is_err()
    {
        error!("shutdown drain timed out, exiting anyway");
    }

    // 11. Final database checkpoint.
    {
        let conn = db.lock().await;
        if let Err(e) = homenet_db::checkpoint(&conn) {
            error!("final checkpoint failed: {e}");
        }
    }

    info!("profile server stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("cannot install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Load the server's Ed25519 network key from settings, generating and
/// persisting a fresh one on first start.
fn load_or_create_keys(conn: &rusqlite::Connection) -> anyhow::Result<NodeKeys> {
    if let Some(stored) = settings::get(conn, settings::NETWORK_PRIVATE_KEY)? {
        let bytes = hex::decode(&stored)
            .map_err(|e| anyhow::anyhow!("corrupt network key in settings: {e}"))?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("corrupt network key in settings: wrong length"))?;
        return Ok(NodeKeys::new(KeyPair::from_bytes(&secret)));
    }

    let keypair = KeyPair::generate();
    settings::set(
        conn,
        settings::NETWORK_PRIVATE_KEY,
        &hex::encode(keypair.signing_key.to_bytes()),
    )?;
    info!("generated new network identity key");
    Ok(NodeKeys::new(KeyPair::from_bytes(
        &keypair.signing_key.to_bytes(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_bootstrap_is_stable() {
        let conn = homenet_db::open_memory().expect("open db");
        let first = load_or_create_keys(&conn).expect("first bootstrap");
        let second = load_or_create_keys(&conn).expect("second bootstrap");
        assert_eq!(first.network_id, second.network_id);
    }

    #[test]
    fn test_corrupt_stored_key_is_fatal() {
        let conn = homenet_db::open_memory().expect("open db");
        settings::set(&conn, settings::NETWORK_PRIVATE_KEY, "not-hex").expect("set");
        assert!(load_or_create_keys(&conn).is_err());
    }
}
