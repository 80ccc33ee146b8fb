use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::ids::ContentHash;

/// Ciphertext travels between peers in 1 MiB slices; receivers place
/// chunk `i` at offset `i * TRANSFER_CHUNK_SIZE` while reassembling.
pub const TRANSFER_CHUNK_SIZE: usize = 1024 * 1024;

/// Upper bound on one encoded record, comfortably above a base64-encoded
/// transfer chunk.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Handshake,
    Data,
    DataRequest,
    DataTransfer,
    Discovery,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Handshake => "handshake",
            Self::Data => "data",
            Self::DataRequest => "data_request",
            Self::DataTransfer => "data_transfer",
            Self::Discovery => "discovery",
        };
        f.write_str(name)
    }
}

/// One wire record.  The payload stays opaque until decoded against the
/// schema of its declared type; on the wire each record is a JSON object
/// followed by a newline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub r#type: MessageType,
    pub sender_id: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub node_id: String,
    pub address: String,
    pub known_peers: Vec<String>,
    /// Present only when the sender already holds the network key.
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub key: Option<Vec<u8>>,
}

/// Announces that the sender can serve `content_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPayload {
    pub content_hash: ContentHash,
    pub file_name: String,
    pub size: u64,
    pub encrypted: bool,
    pub from_watch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequestPayload {
    pub content_hash: ContentHash,
    pub from_watch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTransferPayload {
    pub content_hash: ContentHash,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub chunk_index: u64,
    pub final_chunk: bool,
    pub from_watch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    pub node_id: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Handshake(HandshakePayload),
    Data(DataPayload),
    DataRequest(DataRequestPayload),
    DataTransfer(DataTransferPayload),
    Discovery(DiscoveryPayload),
}

impl Payload {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Self::Handshake(_) => MessageType::Handshake,
            Self::Data(_) => MessageType::Data,
            Self::DataRequest(_) => MessageType::DataRequest,
            Self::DataTransfer(_) => MessageType::DataTransfer,
            Self::Discovery(_) => MessageType::Discovery,
        }
    }
}

impl Message {
    pub fn from_typed(sender_id: &str, payload: &Payload) -> Result<Self> {
        let value = match payload {
            Payload::Handshake(p) => serde_json::to_value(p),
            Payload::Data(p) => serde_json::to_value(p),
            Payload::DataRequest(p) => serde_json::to_value(p),
            Payload::DataTransfer(p) => serde_json::to_value(p),
            Payload::Discovery(p) => serde_json::to_value(p),
        }
        .map_err(|err| Error::MalformedMessage(err.to_string()))?;
        Ok(Self {
            r#type: payload.msg_type(),
            sender_id: sender_id.to_string(),
            payload: value,
        })
    }

    pub fn decode_typed(&self) -> Result<Payload> {
        fn typed<T: serde::de::DeserializeOwned>(
            msg_type: MessageType,
            value: &serde_json::Value,
        ) -> Result<T> {
            serde_json::from_value(value.clone()).map_err(|err| Error::PayloadMismatch {
                msg_type,
                reason: err.to_string(),
            })
        }

        Ok(match self.r#type {
            MessageType::Handshake => Payload::Handshake(typed(self.r#type, &self.payload)?),
            MessageType::Data => Payload::Data(typed(self.r#type, &self.payload)?),
            MessageType::DataRequest => Payload::DataRequest(typed(self.r#type, &self.payload)?),
            MessageType::DataTransfer => {
                Payload::DataTransfer(typed(self.r#type, &self.payload)?)
            }
            MessageType::Discovery => Payload::Discovery(typed(self.r#type, &self.payload)?),
        })
    }

    /// One self-delimited record: JSON followed by a newline.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes =
            serde_json::to_vec(self).map_err(|err| Error::MalformedMessage(err.to_string()))?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|err| Error::MalformedMessage(err.to_string()))
    }
}

pub async fn write_message<W>(io: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let encoded = msg.encode()?;
    io.write_all(&encoded).await?;
    io.flush().await?;
    Ok(())
}

/// Read the next record from `io`.  Returns `Ok(None)` on a clean EOF at
/// a record boundary.
pub async fn read_message<R>(io: &mut R) -> Result<Option<Message>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut line = String::new();
    let n = io.read_line(&mut line).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::InvalidData {
            Error::MalformedMessage("record is not valid utf-8".to_string())
        } else {
            Error::Io(err)
        }
    })?;
    if n == 0 {
        return Ok(None);
    }
    if line.len() > MAX_MESSAGE_BYTES {
        return Err(Error::MalformedMessage(format!(
            "record of {} bytes exceeds the {} byte limit",
            line.len(),
            MAX_MESSAGE_BYTES
        )));
    }
    let msg = Message::decode(line.trim_end().as_bytes())?;
    Ok(Some(msg))
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

mod base64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        bytes
            .as_deref()
            .map(|b| STANDARD.encode(b))
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let text = Option::<String>::deserialize(deserializer)?;
        text.map(|t| STANDARD.decode(t).map_err(serde::de::Error::custom))
            .transpose()
    }
}
