use crate::snapshot::Record;
use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;

const SET_TAG: u8 = 0;
const DELETE_TAG: u8 = 1;

/// Command is the payload of one replicated log entry.
///
/// ```text
/// +-----+-------------------------------------------+
/// | Tag | Record (protobuf; value is empty for Delete) |
/// +-----+-------------------------------------------+
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    Set { key: String, value: String },
    Delete { key: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CommandDecodeError {
    #[error("Command is empty")]
    Empty,

    #[error("Unknown command tag {0}")]
    UnknownTag(u8),

    #[error("Command payload is not a valid record: {0}")]
    InvalidPayload(#[from] prost::DecodeError),
}

impl Command {
    pub fn encode(&self) -> Bytes {
        let (tag, record) = match self {
            Command::Set { key, value } => (SET_TAG, Record::new(key.as_str(), value.as_str())),
            Command::Delete { key } => (DELETE_TAG, Record::new(key.as_str(), "")),
        };

        let mut buf = BytesMut::with_capacity(1 + record.encoded_len());
        buf.put_u8(tag);
        record.encode_raw(&mut buf);
        buf.freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CommandDecodeError> {
        let (tag, payload) = match bytes.split_first() {
            Some((tag, payload)) => (*tag, payload),
            None => return Err(CommandDecodeError::Empty),
        };

        match tag {
            SET_TAG => {
                let record = Record::decode(payload)?;
                Ok(Command::Set {
                    key: record.key,
                    value: record.value,
                })
            }
            DELETE_TAG => {
                let record = Record::decode(payload)?;
                Ok(Command::Delete { key: record.key })
            }
            other => Err(CommandDecodeError::UnknownTag(other)),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Command::Set { key, .. } => key,
            Command::Delete { key } => key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_is_first_byte() {
        let set = Command::Set {
            key: "foo".into(),
            value: "bar".into(),
        };
        let delete = Command::Delete { key: "foo".into() };

        assert_eq!(set.encode()[0], 0);
        assert_eq!(delete.encode()[0], 1);
        assert_eq!(Command::decode(&set.encode()).unwrap(), set);
        assert_eq!(Command::decode(&delete.encode()).unwrap(), delete);
    }

    #[test]
    fn delete_payload_is_a_bare_key_record() {
        let bytes = Command::Delete { key: "foo".into() }.encode();
        let record = Record::decode(&bytes[1..]).unwrap();
        assert_eq!(record, Record::new("foo", ""));
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(matches!(Command::decode(&[]), Err(CommandDecodeError::Empty)));
        assert!(matches!(Command::decode(&[7, 1, 2]), Err(CommandDecodeError::UnknownTag(7))));
        // Field 1, length-delimited, claims 100 bytes.
        assert!(matches!(
            Command::decode(&[0, 0x0a, 100, b'x']),
            Err(CommandDecodeError::InvalidPayload(_))
        ));
    }
}
