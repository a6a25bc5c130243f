/// Webspace daemon and its RPC transport
///
/// - `protocol`: message framing and serialization (length-prefixed JSON)
/// - `server`: Unix socket server and accept loop (one thread per connection)
/// - `client`: call-per-connection client used by the CLI
/// - `methods`: method table and the registered container operations
/// - `auth`: peer credentials and impersonation
/// - `config`: daemon settings
pub mod auth;
pub mod client;
pub mod config;
pub mod methods;
pub mod protocol;
pub mod server;

pub use auth::{AuthContext, PeerIdentity};
pub use client::{Connection, RpcClient};
pub use config::{DaemonConfig, DEFAULT_SOCKET};
pub use methods::{register_backend, MethodTable};
pub use protocol::{
    decode_message, encode_message, read_message, write_message, Call, Message, MessageId, Reply,
};
pub use server::{RpcServer, ShutdownHandle};
