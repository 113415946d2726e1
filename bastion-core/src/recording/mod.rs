mod artifact;
mod channel;
mod ttyrec;

pub use channel::{RecordingChannel, RequestEvent};
