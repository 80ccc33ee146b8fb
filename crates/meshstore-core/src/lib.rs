pub mod config;
pub mod crypto;
pub mod error;
pub mod ids;
pub mod node;
pub mod peer;
pub mod store;
pub mod transport;
pub mod watch;
pub mod wire;

pub use config::NodeConfig;
pub use crypto::{
    content_hash, decrypt_stream, encrypt_stream, generate_iv, NetworkKey, CIPHER_CHUNK_SIZE,
    IV_SIZE, KEY_SIZE,
};
pub use error::{Error, Result};
pub use ids::ContentHash;
pub use node::{Fetched, Node, NodeHandle, PeerInfo, KEY_WAIT_TIMEOUT};
pub use peer::{MessageHandler, Peer};
pub use store::{FileStore, TempFile};
pub use transport::Transport;
pub use wire::{
    read_message, write_message, DataPayload, DataRequestPayload, DataTransferPayload,
    DiscoveryPayload, HandshakePayload, Message, MessageType, Payload, TRANSFER_CHUNK_SIZE,
};
