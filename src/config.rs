use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

/// Bind and payload-size tunables for the mDNS socket, mirroring the
/// teacher's per-subsystem `dns::config::Config` shape.
#[derive(Debug, serde::Deserialize)]
pub struct NetConfig {
    #[serde(default = "NetConfig::default_host")]
    pub host: IpAddr,
    #[serde(default = "NetConfig::default_port")]
    pub port: u16,
    #[serde(default = "NetConfig::default_payload_size")]
    pub max_payload_size: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            max_payload_size: Self::default_payload_size(),
        }
    }
}

impl NetConfig {
    fn default_host() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
    }

    fn default_port() -> u16 {
        mdns_core::MDNS_PORT
    }

    fn default_payload_size() -> usize {
        mdns_proto::buffer::DEFAULT_PAYLOAD_SIZE
    }

    pub fn address(&self) -> SocketAddr {
        SocketAddr::from((self.host, self.port))
    }
}

/// How often the cache reaper sweeps for expired records.
#[derive(Debug, serde::Deserialize)]
pub struct CacheConfig {
    #[serde(default = "CacheConfig::default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            reap_interval_secs: Self::default_reap_interval_secs(),
        }
    }
}

impl CacheConfig {
    fn default_reap_interval_secs() -> u64 {
        10
    }
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub net: NetConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    /// Layered TOML file + environment overlay, same builder shape as the
    /// teacher's `crate::config::Config::load`.
    pub fn load(path: &Path) -> Self {
        let conf = ::config::Config::builder()
            .add_source(::config::File::from(path).required(true))
            .add_source(::config::Environment::default().separator("_"))
            .build()
            .expect("unable to locate configuration file");
        conf.try_deserialize().expect("configuration format invalid")
    }
}
