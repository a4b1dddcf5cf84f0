pub mod config;
pub mod logs;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use mdns_cache::MemoryCacheService;
pub use mdns_core::{rename_service_instance, EngineError, HostDescriptor, ServiceDescriptor, ServiceEvent, State};
use mdns_core::{Engine, EngineConfig, Socket, UdpTransport, MULTICAST_V4};
pub use mdns_proto::{Entry, RecordData, RecordType};
use tokio::sync::mpsc::UnboundedReceiver;

pub use config::Config;

/// Six seconds absent a caller-supplied timeout, per the info-resolution
/// default in the scheduler design.
const DEFAULT_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(6);

/// Embeds an mDNS/DNS-SD engine into a host process: announce services under
/// a locally unique name, discover services of a given type, and resolve a
/// specific instance to address and connection metadata.
///
/// This is the façade the rest of this crate's internals (`mdns-proto`,
/// `mdns-cache`, `mdns-core`) are assembled behind; callers only see this
/// type, [`ServiceDescriptor`], and [`ServiceEvent`].
pub struct Mdns {
    engine: Arc<Engine>,
}

impl Mdns {
    /// Binds the mDNS multicast socket and starts the host's own probe,
    /// announce, and cache-reaping tasks. `host_name` should end in
    /// `.local` and need not be unique yet — collision renaming happens
    /// automatically during probing. `config.net.max_payload_size` caps
    /// how large an outgoing message may grow before the responder splits
    /// it; `config.cache.reap_interval_secs` paces the cache reaper.
    pub async fn new(host_name: impl Into<String>, config: &config::Config) -> std::io::Result<Self> {
        let net = &config.net;
        let socket = UdpTransport::bind(net.address()).await?;
        let iface = match net.host {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        socket.join_multicast(MULTICAST_V4, iface).await?;

        let engine_config = EngineConfig {
            max_payload: net.max_payload_size,
            reap_interval: Duration::from_secs(config.cache.reap_interval_secs),
        };
        let engine = Engine::with_config(host_name, Arc::new(MemoryCacheService::new()), Arc::new(socket), engine_config);
        engine.clone().start();
        Ok(Self { engine })
    }

    /// Sets the host's resolved address, enabling A/AAAA records to be
    /// synthesized for probing and responses.
    pub async fn set_host_address(&self, address: IpAddr) {
        self.engine.set_host_address(address).await;
    }

    /// Registers a service to be probed, announced, and answered for.
    pub async fn register_service(&self, descriptor: ServiceDescriptor) {
        self.engine.register_service(descriptor).await;
    }

    /// Sends a goodbye for the named instance and drops it from the
    /// registry once the goodbye burst completes.
    pub async fn unregister_service(&self, qualified_name: &str) -> Result<(), EngineError> {
        self.engine.unregister_service(qualified_name).await
    }

    /// Unregisters every service this host has published.
    pub async fn unregister_all(&self) {
        self.engine.unregister_all().await;
    }

    /// Updates a registered service's TXT record, re-announcing it if it
    /// was already ANNOUNCED.
    pub async fn set_service_text(&self, qualified_name: &str, text: Vec<u8>) -> Result<(), EngineError> {
        self.engine.set_service_text(qualified_name, text).await
    }

    /// Subscribes to a service type: arms the PTR/meta-query resolvers and
    /// returns a channel of appear/disappear events. Dropping the receiver
    /// is how a caller removes the listener.
    pub fn browse(&self, service_type: &str) -> UnboundedReceiver<ServiceEvent> {
        self.engine.clone().browse(service_type)
    }

    /// Advertises a service type for DNS-SD meta-query purposes, ahead of
    /// registering any instance of it. `register_service` also calls this
    /// automatically for the type it registers.
    pub async fn register_service_type(&self, service_type: &str) {
        self.engine.register_service_type(service_type).await;
    }

    /// Subscribes to the DNS-SD meta-query: a channel of distinct service
    /// types this host observes appearing/disappearing, as opposed to
    /// `browse`'s per-type instance events.
    pub fn browse_types(&self) -> UnboundedReceiver<ServiceEvent> {
        self.engine.clone().browse_types()
    }

    /// Resolves a specific instance's SRV/TXT/address, waiting up to
    /// `timeout` (default 6s) for resolution to complete.
    pub async fn service_info(&self, qualified_name: &str, timeout: Option<Duration>) -> Option<ServiceDescriptor> {
        self.engine
            .clone()
            .request_service_info(qualified_name, timeout.unwrap_or(DEFAULT_RESOLUTION_TIMEOUT))
            .await
    }

    /// Best-effort, non-blocking: whatever the cache currently holds for
    /// this instance, without arming a resolver.
    pub async fn cached_service_info(&self, qualified_name: &str) -> Option<ServiceDescriptor> {
        self.engine.resolve_from_cache(qualified_name).await
    }

    /// Enumerates services of a type that this host has registered.
    pub async fn services_of_type(&self, service_type: &str) -> Vec<ServiceDescriptor> {
        self.engine.services_of_type(service_type).await
    }

    pub async fn service_descriptor(&self, qualified_name: &str) -> Option<ServiceDescriptor> {
        self.engine.service_info(qualified_name).await
    }

    /// Cancels every owned name, sends the host's own goodbye, and closes
    /// the socket.
    pub async fn close(&self) {
        self.engine.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> config::Config {
        let mut config = config::Config::default();
        config.net.host = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        config.net.port = 0;
        config
    }

    #[tokio::test]
    async fn should_bind_register_and_close_without_error() {
        let mdns = Mdns::new("test-host.local", &test_config()).await.unwrap();
        mdns.set_host_address(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))).await;
        mdns.register_service(ServiceDescriptor::new("_http._tcp.local", "printer", "test-host.local", 8080))
            .await;

        assert_eq!(mdns.services_of_type("_http._tcp.local").await.len(), 1);
        mdns.close().await;
    }

    #[tokio::test]
    async fn should_expose_service_type_registration_and_listener() {
        let mdns = Mdns::new("type-host.local", &test_config()).await.unwrap();
        mdns.register_service_type("_ssh._tcp.local").await;
        let _types = mdns.browse_types();
        mdns.register_service(ServiceDescriptor::new("_ssh._tcp.local", "box", "type-host.local", 22))
            .await;
        mdns.close().await;
    }

    #[test]
    fn should_load_config_from_toml_file() {
        let path = std::env::temp_dir().join(format!("mdns-config-test-{}.toml", std::process::id()));
        std::fs::write(&path, "[net]\nport = 5454\n\n[cache]\nreap_interval_secs = 30\n").unwrap();

        let loaded = config::Config::load(&path);
        assert_eq!(loaded.net.port, 5454);
        assert_eq!(loaded.cache.reap_interval_secs, 30);

        std::fs::remove_file(&path).unwrap();
    }
}
