//! P2P networking: transport, session lifecycle, streams, events

mod crypto;
mod error;
mod event;
mod pending;
mod reconnect;
mod session;
mod stream;
mod transport;

pub use crypto::{basic_lock_iv, derive_basic_lock_key, encrypt_key_block_to, StreamCipher};
pub use error::SessionError;
pub use event::{ListenerId, SessionEvent};
pub use pending::{CommandHandle, CommandResponse};
pub use reconnect::{ReconnectPolicy, RECONNECT_BASE_DELAY_MS, RECONNECT_CEILING_MS};
pub use session::{ConnectionType, Session, SessionConfig, SessionState};
pub use stream::{fragment_media, MediaQueues, StreamMetadata};
pub use transport::UdpTransport;
