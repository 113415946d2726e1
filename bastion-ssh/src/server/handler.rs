use bytes::Bytes;
use russh::keys::PublicKey;
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, ChannelOpenFailure, Pty, Sig};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

use crate::common::{DirectTCPIPParams, PtyRequest, ServerChannelId};

/// Everything the downstream SSH connection can tell the relay, collapsed
/// into one event stream consumed by a single `SessionRelay` actor task.
///
/// New-channel notifications, the session channel's early requests, and
/// channel byte data all arrive on the same stream rather than several, with
/// no SFTP or ticket auth, no agent forwarding beyond the ack-and-drop rule,
/// and X11 channel opens rejected outright (see `channel_open_x11` below).
#[derive(Debug)]
pub enum ServerEvent {
    Authenticated(Handle),
    ChannelOpenSession(ServerChannelId, oneshot::Sender<bool>),
    ChannelOpenDirectTcpIp(ServerChannelId, DirectTCPIPParams, oneshot::Sender<bool>),
    Data(ServerChannelId, Bytes),
    ExtendedData(ServerChannelId, Bytes, u32),
    Eof(ServerChannelId),
    Close(ServerChannelId),
    AuthAgentForwardRequest(ServerChannelId),
    PtyRequest(ServerChannelId, PtyRequest),
    ShellRequest(ServerChannelId),
    ExecRequest(ServerChannelId, String, oneshot::Sender<bool>),
    EnvRequest(ServerChannelId, String, String),
    WindowChangeRequest(ServerChannelId, PtyRequest),
    Signal(ServerChannelId, Sig),
    SubsystemRequest(ServerChannelId, String, oneshot::Sender<bool>),
}

/// Translates `russh::server::Handler` callbacks into [`ServerEvent`]s. Owns
/// no state beyond the sender: all session logic lives in the
/// `SessionRelay` actor consuming the other end.
///
/// The server accepts every handshake unconditionally (no in-band
/// authentication), so the authentication callbacks are not translated into
/// events at all — they're answered directly here.
pub struct ServerHandler {
    pub event_tx: UnboundedSender<ServerEvent>,
}

impl russh::server::Handler for ServerHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        let _ = self.event_tx.send(ServerEvent::Authenticated(session.handle()));
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .event_tx
            .send(ServerEvent::ChannelOpenSession(ServerChannelId(channel.id()), tx));
        Ok(rx.await.unwrap_or(false))
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let (tx, rx) = oneshot::channel();
        let _ = self.event_tx.send(ServerEvent::ChannelOpenDirectTcpIp(
            ServerChannelId(channel.id()),
            DirectTCPIPParams {
                host_to_connect: host_to_connect.to_owned(),
                port_to_connect,
                originator_address: originator_address.to_owned(),
                originator_port,
            },
            tx,
        ));
        Ok(rx.await.unwrap_or(false))
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        session.channel_open_failure(
            channel.id(),
            ChannelOpenFailure::UnknownChannelType,
            "connection flow not supported, only interactive sessions are permitted.",
            "en-US",
        )?;
        Ok(false)
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
        let _ = self
            .event_tx
            .send(ServerEvent::Data(ServerChannelId(channel), Bytes::from(data.to_vec())));
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self.event_tx.send(ServerEvent::ExtendedData(
            ServerChannelId(channel),
            Bytes::from(data.to_vec()),
            code,
        ));
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        let _ = self.event_tx.send(ServerEvent::Eof(ServerChannelId(channel)));
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        let _ = self.event_tx.send(ServerEvent::Close(ServerChannelId(channel)));
        Ok(())
    }

    async fn agent_request(&mut self, channel: ChannelId, _session: &mut Session) -> Result<bool, Self::Error> {
        let _ = self
            .event_tx
            .send(ServerEvent::AuthAgentForwardRequest(ServerChannelId(channel)));
        // Ack and drop: replies ok but never forwards agent forwarding upstream.
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self.event_tx.send(ServerEvent::PtyRequest(
            ServerChannelId(channel),
            PtyRequest {
                term: term.to_owned(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes: modes.to_vec(),
            },
        ));
        // Reply ok immediately; want_reply is cleared before the relay sees it.
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        let _ = self.event_tx.send(ServerEvent::ShellRequest(ServerChannelId(channel)));
        session.channel_success(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        let (tx, rx) = oneshot::channel();
        let _ = self
            .event_tx
            .send(ServerEvent::ExecRequest(ServerChannelId(channel), command, tx));

        if rx.await.unwrap_or(false) {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self.event_tx.send(ServerEvent::EnvRequest(
            ServerChannelId(channel),
            variable_name.to_owned(),
            variable_value.to_owned(),
        ));
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self.event_tx.send(ServerEvent::WindowChangeRequest(
            ServerChannelId(channel),
            PtyRequest {
                term: String::new(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes: Vec::new(),
            },
        ));
        Ok(())
    }

    async fn signal(&mut self, channel: ChannelId, signal_name: Sig, _session: &mut Session) -> Result<(), Self::Error> {
        let _ = self
            .event_tx
            .send(ServerEvent::Signal(ServerChannelId(channel), signal_name));
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let (tx, rx) = oneshot::channel();
        let _ = self.event_tx.send(ServerEvent::SubsystemRequest(
            ServerChannelId(channel),
            name.to_owned(),
            tx,
        ));
        if rx.await.unwrap_or(false) {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn auth_publickey(&mut self, _user: &str, _key: &PublicKey) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }
}
