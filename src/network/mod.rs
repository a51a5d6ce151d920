pub mod clients_manager;
pub mod discovery;
pub(crate) mod events;
pub mod identity;
pub mod listener;
pub mod local_client;
pub mod peer;
pub mod state;

pub use clients_manager::{
    ListenerId, LocalClientListener, LocalClientsManager, LocalState, LocalStateListener,
    ManagerBuilder, WeakManager,
};
pub use discovery::{
    discover_from_config, Discover, DiscoveryEvent, DiscoveryService, ManualDiscover,
    MdnsBrowser, MdnsDiscover, StaticDiscover,
};
pub use identity::{DefaultIdentityValidator, IdentityValidator};
pub use listener::{LocalObjectServer, ObjectServerConfig};
pub use local_client::{ClientId, ClientPhase, LocalClient, SecurityLevel, TransportKind};
pub use peer::{Peer, PeerConnectionListener, PeerRole};
pub use state::{ConnectionState, DisconnectionReason};
