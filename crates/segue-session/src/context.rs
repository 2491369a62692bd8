//! Session context: the explicit home of every shared resource.
//!
//! One context per application, passed to every controller. It owns the
//! compiler, the local factory cache, the remote links and their factory
//! handles, and the snapshot store - with teardown order following from
//! plain ownership instead of a global registry.

use crate::snapshot::{SnapshotStore, StoreError};
use parking_lot::Mutex;
use segue_core::{FactoryCache, UnitCompiler, UnitDefinition, UnitFactory};
use segue_remote::{RemoteError, RemoteFactoryHandle, RemoteLink, StreamParams};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

pub struct SessionContext {
    compiler: Arc<dyn UnitCompiler>,
    factories: FactoryCache,
    links: Mutex<HashMap<String, Arc<RemoteLink>>>,
    /// Remote factory handles keyed by (node key, content key). The node may
    /// evict the factory behind a handle at any time, so holders always
    /// re-probe on instance failure instead of trusting this cache.
    remote_factories: Mutex<HashMap<(String, String), RemoteFactoryHandle>>,
    store: SnapshotStore,
    return_host: String,
    /// Base port for per-window OSC control endpoints; `None` disables them.
    osc_port: Option<u16>,
}

fn node_key(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}

impl SessionContext {
    pub fn new(compiler: Arc<dyn UnitCompiler>, home: impl Into<PathBuf>) -> Result<Arc<Self>, StoreError> {
        Self::with_osc_port(compiler, home, None)
    }

    /// Context whose windows also expose OSC control endpoints, scanning
    /// upward from `osc_port` for a free port per window.
    pub fn with_osc_port(
        compiler: Arc<dyn UnitCompiler>,
        home: impl Into<PathBuf>,
        osc_port: Option<u16>,
    ) -> Result<Arc<Self>, StoreError> {
        Ok(Arc::new(Self {
            compiler,
            factories: FactoryCache::new(),
            links: Mutex::new(HashMap::new()),
            remote_factories: Mutex::new(HashMap::new()),
            store: SnapshotStore::open(home)?,
            return_host: "127.0.0.1".to_string(),
            osc_port,
        }))
    }

    pub fn osc_port(&self) -> Option<u16> {
        self.osc_port
    }

    pub fn compiler(&self) -> &dyn UnitCompiler {
        self.compiler.as_ref()
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Address remote nodes should stream back to.
    pub fn return_host(&self) -> &str {
        &self.return_host
    }

    /// The fixed return-stream configuration sent with every remote request.
    pub fn stream_params(&self) -> StreamParams {
        StreamParams::new(self.return_host.clone())
    }

    /// Compile (or fetch the cached factory for) a local definition.
    pub fn local_factory(
        &self,
        definition: &UnitDefinition,
    ) -> segue_core::Result<Arc<dyn UnitFactory>> {
        self.factories
            .get_or_compile(definition, self.compiler.as_ref())
    }

    pub fn factory_cache(&self) -> &FactoryCache {
        &self.factories
    }

    /// Connection to `host:port`, opening it on first use.
    pub fn link_to(&self, host: &str, port: u16) -> Result<Arc<RemoteLink>, RemoteError> {
        let key = node_key(host, port);
        let mut links = self.links.lock();
        if let Some(link) = links.get(&key) {
            return Ok(link.clone());
        }
        let link = Arc::new(RemoteLink::connect(host, port)?);
        links.insert(key, link.clone());
        Ok(link)
    }

    /// Tear down the connection to a node (its factory handles go with it).
    pub fn drop_link(&self, host: &str, port: u16) {
        let key = node_key(host, port);
        self.links.lock().remove(&key);
        self.remote_factories
            .lock()
            .retain(|(node, _), _| node != &key);
    }

    /// Cached remote factory handle for this definition on this node, or
    /// upload the source and get a fresh one.
    pub fn remote_factory(
        &self,
        link: &Arc<RemoteLink>,
        definition: &UnitDefinition,
    ) -> Result<RemoteFactoryHandle, RemoteError> {
        let cache_key = (
            node_key(link.host(), link.port()),
            definition.content_key(),
        );
        if let Some(handle) = self.remote_factories.lock().get(&cache_key) {
            return Ok(handle.clone());
        }
        let handle = link.upload_factory(definition)?;
        self.remote_factories
            .lock()
            .insert(cache_key, handle.clone());
        Ok(handle)
    }

    /// Forget a handle the node reported missing.
    pub fn invalidate_remote_factory(&self, link: &Arc<RemoteLink>, content_key: &str) {
        let cache_key = (
            node_key(link.host(), link.port()),
            content_key.to_string(),
        );
        self.remote_factories.lock().remove(&cache_key);
    }
}
