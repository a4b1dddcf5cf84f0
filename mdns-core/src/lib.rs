pub mod conflict;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod socket;
pub mod state;
pub mod tasks;

pub use conflict::{handle_address, handle_host_information, handle_service, Verdict};
pub use descriptor::{rename_service_instance, HostDescriptor, ServiceDescriptor};
pub use engine::{Engine, EngineConfig, Owner, ServiceEvent, META_QUERY_NAME};
pub use error::EngineError;
pub use socket::{multicast_address, Datagram, Socket, UdpTransport, MDNS_PORT, MULTICAST_V4};
pub use state::{State, StateMachine};
