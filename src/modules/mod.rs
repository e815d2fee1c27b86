pub mod channel;
pub mod client;
pub mod crypto;
pub mod framing;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
