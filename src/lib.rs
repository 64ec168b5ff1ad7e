mod actor;
mod api;
mod commitlog;
mod fsm;
mod membership;
mod replica;
mod server;
mod snapshot;
mod store;
mod transport;
mod grpc {
    include!("../generated/raft.rs");
}

pub use api::try_create_node;
pub use api::ElectionEvent;
pub use api::Event;
pub use api::EventListener;
pub use api::FollowerEventData;
pub use api::LeaderInfo;
pub use api::NodeConfig;
pub use api::NodeCreationError;
pub use api::RaftOptions;
pub use api::ReplicatedStore;
pub use api::Server;
pub use fsm::Command;
pub use fsm::CommandDecodeError;
pub use membership::GossipOptions;
pub use membership::HandlerError;
pub use membership::Member;
pub use membership::MemberEvent;
pub use membership::MemberStatus;
pub use membership::Membership;
pub use membership::MembershipConfig;
pub use membership::MembershipError;
pub use membership::MembershipHandler;
pub use membership::RPC_ADDR_TAG;
pub use snapshot::CorruptSnapshot;
pub use snapshot::Record;
pub use snapshot::RecordCodec;
pub use snapshot::RecordDecoder;
pub use snapshot::SnapshotStream;
pub use store::KeyValueDb;
pub use store::KeyValueStore;
pub use store::StoreError;
pub use store::StoreLimits;
pub use transport::ServerPeerStream;
pub use transport::StreamLayer;
pub use transport::TlsConfig;
pub use transport::TransportError;

// Learning 1: `create::{root_mod}` should not have any code. Just `mod` and `pub use` statements.
// Learning 2: All `mod` statements, anywhere, should not be `pub`. Only export `pub` via individual
//             use statements.
//
// This keeps the `crate::{root_mod}` root_mod only responsible for exporting types to the rest of
// crate, and allows me to organize my root_mod impl however I want.
