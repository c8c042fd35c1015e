//! Neighbor replication end-to-end: two servers, one drainer.
//!
//! Server B registers as a follower of server A; A's drainer pushes the
//! snapshot and subsequent profile changes to B's primary role, where
//! they land as mirrored profiles.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, Notify};

use homenet_crypto::{identity_id, KeyPair, NodeKeys};
use homenet_images::ImageStore;
use homenet_search::ResultCache;
use homenet_server::conversation::Conversation;
use homenet_server::registry::Registry;
use homenet_server::roles::Role;
use homenet_server::{Context, RolePorts, ServerContext, ServerLimits};
use homenet_sync::{SyncConfig, SyncContext};
use homenet_types::{GpsLocation, Profile, ProfileScope, ProfileVersion};

struct Node {
    ctx: Context,
    sync_ctx: Arc<SyncContext>,
    primary_addr: SocketAddr,
    _images_dir: tempfile::TempDir,
}

async fn node() -> Node {
    let images_dir = tempfile::tempdir().expect("tempdir");
    let images = ImageStore::open(images_dir.path().join("images"))
        .await
        .expect("open image store");
    let conn = homenet_db::open_memory().expect("open db");
    let db = Arc::new(Mutex::new(conn));
    let keys = Arc::new(NodeKeys::new(KeyPair::generate()));
    let (shutdown_tx, _) = broadcast::channel(1);
    let actions_changed = Arc::new(Notify::new());

    let ctx = Arc::new(ServerContext {
        db: Arc::clone(&db),
        images: images.clone(),
        keys: Arc::clone(&keys),
        limits: ServerLimits::default(),
        ports: RolePorts {
            primary: 1,
            client_non_tls: 2,
            client_tls: 3,
            app_service_tls: 4,
        },
        search_cache: std::sync::Mutex::new(ResultCache::new()),
        relationships: std::sync::Mutex::new(
            homenet_server::relationships::RelationshipStore::new(),
        ),
        registry: Registry::new(),
        actions_changed: Arc::clone(&actions_changed),
        shutdown: shutdown_tx.clone(),
    });

    // Primary role listener on an ephemeral port.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let primary_addr = listener.local_addr().expect("local addr");
    {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            loop {
                let Ok((stream, peer_addr)) = listener.accept().await else {
                    break;
                };
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    Conversation::new(ctx, Role::Primary, Box::new(stream), peer_addr)
                        .run()
                        .await;
                });
            }
        });
    }

    let sync_ctx = Arc::new(SyncContext {
        db,
        images,
        keys,
        actions_changed,
        shutdown: shutdown_tx,
        config: SyncConfig {
            loc_endpoint: SocketAddr::from(([127, 0, 0, 1], 1)),
            primary_port: primary_addr.port(),
            max_neighbors: 105,
            neighbor_expiration_secs: 24 * 3600,
        },
    });

    Node {
        ctx,
        sync_ctx,
        primary_addr,
        _images_dir: images_dir,
    }
}

fn hosted_profile(byte: u8, name: &str) -> Profile {
    Profile {
        identity_id: identity_id(&[byte; 32]),
        public_key: vec![byte; 32],
        profile_type: "IoP.Person".to_string(),
        name: name.to_string(),
        version: ProfileVersion::new(1, 0, 0),
        location: GpsLocation::new(50.0, 14.0).expect("valid location"),
        extra_data: String::new(),
        profile_image: None,
        thumbnail_image: None,
        expires_at: None,
        scope: ProfileScope::Hosted,
    }
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(false, "timed out waiting for {what}");
}

#[tokio::test]
async fn test_snapshot_and_incremental_replication() {
    let a = node().await;
    let b = node().await;

    // A hosts three initialized profiles.
    {
        let conn = a.ctx.db.lock().await;
        for (byte, name) in [(1u8, "Alice"), (2u8, "Bob"), (3u8, "Carol")] {
            homenet_db::queries::identities::insert(&conn, &hosted_profile(byte, name), 100)
                .expect("insert");
        }
    }

    // B must know A as a neighbor before accepting its pushes.
    {
        let conn = b.ctx.db.lock().await;
        homenet_db::queries::neighbors::upsert(
            &conn,
            &a.sync_ctx.keys.network_id,
            "127.0.0.1",
            a.primary_addr.port(),
            0,
            100,
        )
        .expect("neighbor row");
    }

    // B registers as a follower of A, as the LOC-add path would.
    homenet_sync::neighbors::request_initialization(
        &b.sync_ctx,
        &a.sync_ctx.keys.network_id,
        &a.primary_addr.to_string(),
    )
    .await
    .expect("initialization request");

    // A's drainer delivers the snapshot to B's primary role.
    let drainer = homenet_sync::drainer::spawn(Arc::clone(&a.sync_ctx));
    a.sync_ctx.actions_changed.notify_one();

    let b_db = Arc::clone(&b.ctx.db);
    let a_id = a.sync_ctx.keys.network_id;
    wait_until("snapshot to arrive", || {
        let db = Arc::clone(&b_db);
        async move {
            let conn = db.lock().await;
            homenet_db::queries::identities::count_for_neighbor(&conn, &a_id)
                .expect("count")
                == 3
        }
    })
    .await;

    // The follower flips to initialized once the queue drains.
    let a_db = Arc::clone(&a.ctx.db);
    let b_id = b.sync_ctx.keys.network_id;
    wait_until("follower initialization", || {
        let db = Arc::clone(&a_db);
        async move {
            let conn = db.lock().await;
            homenet_db::queries::followers::get(&conn, &b_id)
                .map(|f| f.initialized)
                .unwrap_or(false)
        }
    })
    .await;

    // An incremental change drains in order after the snapshot.
    {
        let mut changed = hosted_profile(1, "Alicia");
        changed.version = ProfileVersion::new(1, 0, 1);
        let conn = a.ctx.db.lock().await;
        homenet_db::queries::identities::update(&conn, &changed).expect("update");
        let item = homenet_sync::actions::change_item(&a.sync_ctx.images, &changed);
        homenet_sync::actions::enqueue_for_all_followers(
            &conn,
            &changed.identity_id,
            &item,
            200,
        )
        .expect("enqueue");
    }
    a.sync_ctx.actions_changed.notify_one();

    let alice_id = identity_id(&[1u8; 32]);
    wait_until("change to arrive", || {
        let db = Arc::clone(&b_db);
        async move {
            let conn = db.lock().await;
            homenet_db::queries::identities::get_neighbor(&conn, &alice_id, &a_id)
                .map(|p| p.name == "Alicia")
                .unwrap_or(false)
        }
    })
    .await;

    drainer.abort();
}
