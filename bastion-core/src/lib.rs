pub mod key_provider;
pub mod recording;
pub mod trust_store;

pub use key_provider::KeyProvider;
pub use recording::{RecordingChannel, RequestEvent};
pub use trust_store::{TrustStore, Verdict};
