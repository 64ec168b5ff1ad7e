//! This mod holds the client-facing API: the replicated store, node wiring, and options.
mod event_bus;
mod options;
mod replicated_store;
mod types;
mod wiring;

pub use event_bus::ElectionEvent;
pub use event_bus::Event;
pub use event_bus::EventListener;
pub use event_bus::FollowerEventData;
pub use options::RaftOptions;
pub use replicated_store::ReplicatedStore;
pub use types::LeaderInfo;
pub use types::Server;
pub use wiring::try_create_node;
pub use wiring::NodeConfig;
pub use wiring::NodeCreationError;
