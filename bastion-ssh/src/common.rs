use std::fmt::{Display, Formatter};

use russh::{ChannelId, Pty, Sig};

/// Identifies a channel on the downstream connection. Newtype over
/// `ChannelId` so the server-side and client-side channel identifiers can
/// never be mixed up at a call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ServerChannelId(pub ChannelId);

impl Display for ServerChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct PtyRequest {
    pub term: String,
    pub col_width: u32,
    pub row_height: u32,
    pub pix_width: u32,
    pub pix_height: u32,
    pub modes: Vec<(Pty, u32)>,
}

#[derive(Clone, Debug)]
pub struct DirectTCPIPParams {
    pub host_to_connect: String,
    pub port_to_connect: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

/// One early-session channel request, rewritten and handed to the relay's
/// masked request queue.
///
/// Request types that the SSH wire format lets the client expect a
/// true/false reply for (`exec`, `subsystem`) carry a `reply_tx`: the relay
/// resolves it once the matching upstream response arrives. Types the
/// protocol never replies to (`env`, window-change, signal) carry `None`;
/// types we already answered early (`pty-req`, `shell`) also carry `None`
/// since "clear want_reply" means the upstream copy travels with no reply
/// expected.
pub struct RelayRequest {
    pub payload: RelayPayload,
    pub reply_tx: Option<tokio::sync::oneshot::Sender<bool>>,
}

#[derive(Debug)]
pub enum RelayPayload {
    PtyRequest(PtyRequest),
    Shell,
    Exec(String),
    Env(String, String),
    WindowChange(PtyRequest),
    Signal(Sig),
    Subsystem(String),
}
