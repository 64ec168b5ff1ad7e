mod config;
mod error;
mod handler;
mod member;
mod member_list;
mod membership;
mod message;

pub use config::GossipOptions;
pub use config::MembershipConfig;
pub use error::MembershipError;
pub use handler::HandlerError;
pub use handler::MembershipHandler;
pub use member::Member;
pub use member::MemberEvent;
pub use member::MemberStatus;
pub use member::RPC_ADDR_TAG;
pub use membership::Membership;
