use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bastion_common::error::BastionError;
use bastion_core::{KeyProvider, RecordingChannel, TrustStore};
use russh::client::Handle as ClientHandle;
use russh::server::Handle;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::bidi_proxy::{BidiProxy, DownstreamEvent};
use crate::common::{RelayPayload, RelayRequest, ServerChannelId};
use crate::server::handler::ServerEvent;
use crate::upstream::{open_session_channel, ClientHandler, UpstreamDialer};

/// Bounded capacity of the masked early-request queue: normal clients issue
/// at most a handful of requests before `shell`/`exec`, so a full queue
/// blocking the dance task briefly is acceptable.
const MASKED_REQUEST_QUEUE_CAPACITY: usize = 5;

/// The per-connection state machine. Owns nothing beyond a single downstream
/// connection's lifetime; constructed fresh by [`crate::server::Server`] for
/// every accepted transport.
///
/// Shaped as an actor consuming a `Handler`'s event stream, the way a
/// session-scoped SSH relay naturally decomposes.
pub struct SessionRelay {
    user_name: String,
    target_address: String,
    remote_addr: SocketAddr,
    group_ids: Vec<String>,
    key_provider: KeyProvider,
    trust_store: Arc<TrustStore>,
    log_root: PathBuf,
}

impl SessionRelay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_name: String,
        target_address: String,
        remote_addr: SocketAddr,
        group_ids: Vec<String>,
        key_provider: KeyProvider,
        trust_store: Arc<TrustStore>,
        log_root: PathBuf,
    ) -> Self {
        Self {
            user_name,
            target_address,
            remote_addr,
            group_ids,
            key_provider,
            trust_store,
            log_root,
        }
    }

    pub async fn run(self, mut events_rx: mpsc::UnboundedReceiver<ServerEvent>) -> anyhow::Result<()> {
        let downstream_handle = wait_for_authentication(&mut events_rx).await?;

        let ch0 = match wait_for_session_channel(&mut events_rx).await {
            Some(id) => id,
            None => return Err(BastionError::UnknownChannelType("expected session channel".into()).into()),
        };

        let start_time = OffsetDateTime::now_utc();
        let recorder = Arc::new(RecordingChannel::new(self.log_root.clone(), self.user_name.clone(), start_time));

        let (ch0_downstream_tx, ch0_downstream_rx) = mpsc::unbounded_channel();
        let (masked_tx, masked_rx) = mpsc::channel(MASKED_REQUEST_QUEUE_CAPACITY);

        // Step 2: consume ch0's requests until shell/exec signals readiness.
        let ready = run_early_reply_dance(&mut events_rx, ch0, &masked_tx, &ch0_downstream_tx).await;
        if !ready {
            return Ok(());
        }

        // Step 3: sync the recording artifacts to disk.
        let sanitized_host = sanitize_host(&self.target_address);
        if let Err(source) = recorder.sync_to_file(&sanitized_host).await {
            let error = BastionError::RecordingInitFailed(source);
            warn!(%error, "failed to initialize session recording");
            recorder.write(b"Failed to Initialize Session.\r\n").await;
            return Ok(());
        }

        // Step 4: load keys and dial upstream.
        let signers = self.key_provider.keys_for(&self.group_ids).await;
        info!(
            target = %self.target_address,
            user = %self.user_name,
            remote = %self.remote_addr,
            "Connecting to remote for relay"
        );
        let dialer = UpstreamDialer::new(self.trust_store.clone());
        let upstream_handle = match dialer.dial(&self.target_address, &self.user_name, signers).await {
            Ok(handle) => handle,
            Err(error) => {
                recorder.write(format!("Connect failed: {error}\r\n").as_bytes()).await;
                return Ok(());
            }
        };

        // Step 5: open the upstream session channel.
        let upstream_channel = match open_session_channel(&upstream_handle).await {
            Ok(channel) => channel,
            Err(error) => {
                recorder
                    .write(format!("Remote session setup failed: {error}\r\n").as_bytes())
                    .await;
                return Ok(());
            }
        };

        info!(
            target = %self.target_address,
            user = %self.user_name,
            remote = %self.remote_addr,
            "Connected to remote for relay"
        );

        let upstream_handle = Arc::new(Mutex::new(upstream_handle));

        // Step 6: concurrently accept further channels (direct-tcpip) and
        // forward ch0's post-readiness events into the Step 7 proxy.
        let demux_handle = tokio::spawn(run_channel_demux(
            events_rx,
            ch0,
            upstream_handle.clone(),
            downstream_handle.clone(),
            recorder.clone(),
            ch0_downstream_tx,
            masked_tx,
        ));

        // Step 7: run the session proxy until it exits, then tear down.
        BidiProxy::run(
            upstream_channel,
            downstream_handle,
            ch0,
            ch0_downstream_rx,
            masked_rx,
            recorder.clone(),
        )
        .await;

        demux_handle.abort();
        let _ = upstream_handle
            .lock()
            .await
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await;
        recorder.close().await;

        info!(
            target = %self.target_address,
            user = %self.user_name,
            remote = %self.remote_addr,
            "Disconnected from remote for relay"
        );

        Ok(())
    }
}

async fn wait_for_authentication(events_rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> anyhow::Result<Handle> {
    while let Some(event) = events_rx.recv().await {
        if let ServerEvent::Authenticated(handle) = event {
            return Ok(handle);
        }
    }
    Err(BastionError::UpstreamSessionFailed("connection closed before authentication".into()).into())
}

/// Accepts the first channel if (and only if) it's a `session` channel,
/// rejecting anything else.
async fn wait_for_session_channel(events_rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Option<ServerChannelId> {
    while let Some(event) = events_rx.recv().await {
        match event {
            ServerEvent::ChannelOpenSession(id, reply_tx) => {
                let _ = reply_tx.send(true);
                return Some(id);
            }
            ServerEvent::ChannelOpenDirectTcpIp(_, _, reply_tx) => {
                let _ = reply_tx.send(false);
                return None;
            }
            _ => continue,
        }
    }
    None
}

/// Step 2's early-reply dance: buffers rewritten requests into `masked_tx`
/// (capacity 5) and returns once `shell` or `exec` has been observed. Any
/// ch0 byte data seen meanwhile is queued into `ch0_downstream_tx` so
/// nothing is lost once the Step 7 proxy starts draining it.
async fn run_early_reply_dance(
    events_rx: &mut mpsc::UnboundedReceiver<ServerEvent>,
    ch0: ServerChannelId,
    masked_tx: &mpsc::Sender<RelayRequest>,
    ch0_downstream_tx: &mpsc::UnboundedSender<DownstreamEvent>,
) -> bool {
    while let Some(event) = events_rx.recv().await {
        match event {
            ServerEvent::PtyRequest(id, req) if id == ch0 => {
                let _ = masked_tx
                    .send(RelayRequest {
                        payload: RelayPayload::PtyRequest(req),
                        reply_tx: None,
                    })
                    .await;
            }
            ServerEvent::ShellRequest(id) if id == ch0 => {
                let _ = masked_tx
                    .send(RelayRequest {
                        payload: RelayPayload::Shell,
                        reply_tx: None,
                    })
                    .await;
                return true;
            }
            ServerEvent::ExecRequest(id, command, reply_tx) if id == ch0 => {
                let _ = masked_tx
                    .send(RelayRequest {
                        payload: RelayPayload::Exec(command),
                        reply_tx: Some(reply_tx),
                    })
                    .await;
                return true;
            }
            ServerEvent::EnvRequest(id, name, value) if id == ch0 => {
                let _ = masked_tx
                    .send(RelayRequest {
                        payload: RelayPayload::Env(name, value),
                        reply_tx: None,
                    })
                    .await;
            }
            ServerEvent::SubsystemRequest(id, name, reply_tx) if id == ch0 => {
                // Forwarded unmodified: subsystem keeps its want_reply,
                // resolved once the upstream response arrives.
                let _ = masked_tx
                    .send(RelayRequest {
                        payload: RelayPayload::Subsystem(name),
                        reply_tx: Some(reply_tx),
                    })
                    .await;
            }
            ServerEvent::Data(id, data) if id == ch0 => {
                let _ = ch0_downstream_tx.send(DownstreamEvent::Data(data));
            }
            ServerEvent::Eof(id) if id == ch0 => {
                let _ = ch0_downstream_tx.send(DownstreamEvent::Eof);
            }
            ServerEvent::Close(id) if id == ch0 => {
                let _ = ch0_downstream_tx.send(DownstreamEvent::Close);
                return false;
            }
            ServerEvent::ChannelOpenDirectTcpIp(_, _, reply_tx) => {
                // Not yet dialed upstream; nothing to proxy to.
                let _ = reply_tx.send(false);
            }
            _ => continue,
        }
    }
    false
}

/// Step 6: once the upstream session is dialed, accept further channels
/// (`direct-tcpip`, each running its own independent [`BidiProxy`]) and
/// route ch0's post-readiness events (window resizes, further data,
/// EOF/close) to the already-running Step 7 proxy via the same senders it
/// was started with.
#[allow(clippy::too_many_arguments)]
async fn run_channel_demux(
    mut events_rx: mpsc::UnboundedReceiver<ServerEvent>,
    ch0: ServerChannelId,
    upstream_handle: Arc<Mutex<ClientHandle<ClientHandler>>>,
    downstream_handle: Handle,
    recorder: Arc<RecordingChannel>,
    ch0_downstream_tx: mpsc::UnboundedSender<DownstreamEvent>,
    ch0_masked_tx: mpsc::Sender<RelayRequest>,
) {
    // Routes for channels opened after ch0 (currently only `direct-tcpip`
    // forwards), keyed by the downstream channel id each was accepted on.
    let mut routes: HashMap<ServerChannelId, mpsc::UnboundedSender<DownstreamEvent>> = HashMap::new();

    while let Some(event) = events_rx.recv().await {
        match event {
            ServerEvent::ChannelOpenDirectTcpIp(id, params, reply_tx) => {
                let open_result = {
                    let handle = upstream_handle.lock().await;
                    handle
                        .channel_open_direct_tcpip(
                            params.host_to_connect.clone(),
                            params.port_to_connect,
                            params.originator_address.clone(),
                            params.originator_port,
                        )
                        .await
                };
                match open_result {
                    Ok(upstream_channel) => {
                        let _ = reply_tx.send(true);
                        let (downstream_tx, downstream_rx) = mpsc::unbounded_channel();
                        // Forwarded channels carry no ssh requests beyond
                        // open/data/eof/close; the request queue stays empty.
                        let (_no_requests_tx, no_requests_rx) = mpsc::channel(1);
                        routes.insert(id, downstream_tx);
                        let downstream_handle = downstream_handle.clone();
                        let recorder = recorder.clone();
                        tokio::spawn(BidiProxy::run(
                            upstream_channel,
                            downstream_handle,
                            id,
                            downstream_rx,
                            no_requests_rx,
                            recorder,
                        ));
                    }
                    Err(error) => {
                        warn!(%error, "failed to open upstream direct-tcpip channel");
                        let _ = reply_tx.send(false);
                    }
                }
            }
            ServerEvent::Data(id, data) if id == ch0 => {
                let _ = ch0_downstream_tx.send(DownstreamEvent::Data(data));
            }
            ServerEvent::ExtendedData(id, data, ext) if id == ch0 => {
                let _ = ch0_downstream_tx.send(DownstreamEvent::ExtendedData(data, ext));
            }
            ServerEvent::Eof(id) if id == ch0 => {
                let _ = ch0_downstream_tx.send(DownstreamEvent::Eof);
            }
            ServerEvent::Close(id) if id == ch0 => {
                let _ = ch0_downstream_tx.send(DownstreamEvent::Close);
                break;
            }
            ServerEvent::WindowChangeRequest(id, req) if id == ch0 => {
                let _ = ch0_masked_tx
                    .send(RelayRequest {
                        payload: RelayPayload::WindowChange(req),
                        reply_tx: None,
                    })
                    .await;
            }
            ServerEvent::Signal(id, signal) if id == ch0 => {
                let _ = ch0_masked_tx
                    .send(RelayRequest {
                        payload: RelayPayload::Signal(signal),
                        reply_tx: None,
                    })
                    .await;
            }
            ServerEvent::SubsystemRequest(id, name, reply_tx) if id == ch0 => {
                let _ = ch0_masked_tx
                    .send(RelayRequest {
                        payload: RelayPayload::Subsystem(name),
                        reply_tx: Some(reply_tx),
                    })
                    .await;
            }
            ServerEvent::Data(id, data) => {
                if let Some(route) = routes.get(&id) {
                    let _ = route.send(DownstreamEvent::Data(data));
                }
            }
            ServerEvent::ExtendedData(id, data, ext) => {
                if let Some(route) = routes.get(&id) {
                    let _ = route.send(DownstreamEvent::ExtendedData(data, ext));
                }
            }
            ServerEvent::Eof(id) => {
                if let Some(route) = routes.get(&id) {
                    let _ = route.send(DownstreamEvent::Eof);
                }
            }
            ServerEvent::Close(id) => {
                if let Some(route) = routes.remove(&id) {
                    let _ = route.send(DownstreamEvent::Close);
                }
            }
            _ => {}
        }
    }
}

fn sanitize_host(target_address: &str) -> String {
    let host = target_address.split(':').next().unwrap_or(target_address);
    host.replace('/', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_the_port_from_a_host_port_target() {
        assert_eq!(sanitize_host("db1.internal:22"), "db1.internal");
    }

    #[test]
    fn host_without_a_port_is_passed_through() {
        assert_eq!(sanitize_host("db1.internal"), "db1.internal");
    }

    #[test]
    fn slashes_are_replaced_so_the_result_is_a_safe_path_component() {
        assert_eq!(sanitize_host("weird/host:22"), "weird_host");
    }
}
