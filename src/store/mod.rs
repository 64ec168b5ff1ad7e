mod db;
mod error;
mod kv_store;

pub use db::KeyValueDb;
pub use error::StoreError;
pub use kv_store::KeyValueStore;
pub use kv_store::StoreLimits;
