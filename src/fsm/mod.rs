mod command;
mod kv_state_machine;

pub use command::Command;
pub use command::CommandDecodeError;
pub(crate) use kv_state_machine::KvStateMachine;
