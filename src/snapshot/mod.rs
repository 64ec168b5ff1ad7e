mod codec;
mod record;
mod stream;

pub use codec::CorruptSnapshot;
pub use codec::RecordCodec;
pub use codec::RecordDecoder;
pub use record::Record;
pub use stream::SnapshotStream;
