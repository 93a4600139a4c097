use std::{
    net::SocketAddr,
    ops::Deref,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use ddrp_rs::{
    config::Config,
    kv::pluggables::KVGet,
    node::{Node, NodeSpec},
    types::{crypto_primitives::Keypair, header::Header},
};
use tempfile::TempDir;

use super::{mem_db::MemDB, registry::StaticRegistry};

/// A config for nodes that talk to each other over loopback, with every timer short enough for a
/// test and the periodic tasks the tests trigger by hand pushed far out.
pub(crate) fn test_config() -> Config {
    let mut config = Config::default();
    config.p2p.host = "127.0.0.1".into();
    config.p2p.port = 0;
    config.p2p.allow_local_peers = true;
    config.p2p.refill_interval = Duration::from_secs(60 * 60);
    config.timebank.min_update_interval = Duration::ZERO;
    config.updater.poll_interval = Duration::from_millis(20);
    config.updater.fetch_timeout = Duration::from_secs(5);
    config.updater.gossip_import_height_diff = 0;
    config.name_importer.confirmation_depth = 0;
    config.name_importer.interval = Duration::from_millis(100);
    config.name_syncer.interval = Duration::from_secs(60 * 60);
    config.name_syncer.update_response_timeout = Duration::from_secs(2);
    config.name_syncer.sync_response_timeout = Duration::from_secs(10);
    config
}

/// A [`Node`] running on loopback with its own temporary home directory.
pub(crate) struct TestNode {
    node: Node<MemDB>,
    // Dropped after `node`, so the blobs outlive the node's threads.
    _home: TempDir,
}

impl TestNode {
    pub(crate) fn start(registry: Arc<StaticRegistry>) -> TestNode {
        TestNode::start_with(registry, |_| ())
    }

    pub(crate) fn start_with(
        registry: Arc<StaticRegistry>,
        configure: impl FnOnce(&mut Config),
    ) -> TestNode {
        let mut config = test_config();
        configure(&mut config);
        let home = tempfile::tempdir().unwrap();
        let node = NodeSpec::builder()
            .config(config)
            .signing_key(Keypair::generate())
            .home(home.path())
            .kv_store(MemDB::new())
            .registry(registry)
            .build()
            .start()
            .unwrap();
        TestNode { node, _home: home }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.node.local_addr().unwrap()
    }

    pub(crate) fn header(&self, name: &str) -> Option<Header> {
        self.node.kv().header(name).unwrap()
    }

    /// Block until the importer has picked up `name`.
    pub(crate) fn wait_for_name(&self, name: &str) {
        assert!(
            wait_until(Duration::from_secs(5), || self
                .node
                .kv()
                .name_info(name)
                .unwrap()
                .is_some()),
            "{} was never imported",
            name
        );
    }
}

impl Deref for TestNode {
    type Target = Node<MemDB>;

    fn deref(&self) -> &Node<MemDB> {
        &self.node
    }
}

/// Poll `condition` until it holds or `timeout` passes. Returns whether it held.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    condition()
}
