/// Record is the unit of storage, and the payload of every snapshot frame.
///
/// Encoded with protobuf so the snapshot format stays stable across versions.
#[derive(Clone, Eq, Hash, PartialEq, prost::Message)]
pub struct Record {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

impl Record {
    pub fn new<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        Record {
            key: key.into(),
            value: value.into(),
        }
    }
}
