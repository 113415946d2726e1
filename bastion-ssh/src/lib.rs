pub mod bidi_proxy;
pub mod common;
pub mod keys;
pub mod server;
pub mod session_relay;
pub mod upstream;

pub use server::Server;
