//! Demo binary wiring a `Config`, a `NameServiceNode`, and a `StateCache`
//! together end to end: register a name, open/lock/oplock a path, rename
//! it.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use nbcluster::cluster::{
    AccessMask, AccessParams, ByteLock, ClusterBus, ClusterFileState, GrantOutcome, LocalClusterMap, OwnerId, StateCache,
};
use nbcluster::config::ConfigArgs;
use nbcluster::netbios::{NameKind, NameServiceNode, NetBiosName};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = ConfigArgs::parse();
    let config = args.resolve().expect("failed to resolve configuration");

    let node = NameServiceNode::start(config.clone()).expect("failed to start name service node");
    node.add_add_name_listener(Box::new(|outcome| {
        tracing::info!(?outcome, "name registration outcome");
    }));

    let server_name = NetBiosName::new(&config.server_name, NameKind::FileServer.suffix(), false);
    node.add_name(server_name.clone(), vec![Ipv4Addr::LOCALHOST], 300);

    let map: Arc<LocalClusterMap<String, ClusterFileState>> = Arc::new(LocalClusterMap::new());
    let bus = ClusterBus::new(64);
    let cache = StateCache::new(map, bus, config.server_name.clone(), config.deferred_queue_capacity);

    let owner = OwnerId { session: 1, tree: 1, file_id: 1 };
    let params = AccessParams { access: AccessMask::READ, share_allow: AccessMask::READ };
    let outcome = cache.grant_access("/share/report.csv", owner, params).await.expect("grant_access failed");
    let token = match outcome {
        GrantOutcome::Granted(token) => token,
        GrantOutcome::BreakInProgress { holder_node } => {
            panic!("unexpected break in progress, held by {holder_node}");
        }
    };
    tracing::info!(path = %token.path, "opened file for read");

    let lock = ByteLock { offset: 0, length: 1024, owner_pid: 42, owner_session: owner.session, exclusive: true };
    cache.add_lock("/share/report.csv", lock).await.expect("add_lock failed");

    let renamed = cache.rename("/share/report.csv", "/share/report-final.csv", false).await.expect("rename failed");
    tracing::info!(renamed, "renamed report");

    cache.release_access("/share/report-final.csv", token).await.expect("release_access failed");

    tokio::time::sleep(Duration::from_millis(100)).await;
    node.shutdown(false);
}
