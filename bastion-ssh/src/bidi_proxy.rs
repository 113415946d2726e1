use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bastion_core::{RecordingChannel, RequestEvent};
use bytes::Bytes;
use russh::client::Msg;
use russh::server::Handle;
use russh::{Channel, ChannelMsg, CryptoVec};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::common::{RelayPayload, RelayRequest, ServerChannelId};

/// One event observed on the downstream channel, as translated by the
/// server-side `Handler`.
#[derive(Debug)]
pub enum DownstreamEvent {
    Data(Bytes),
    ExtendedData(Bytes, u32),
    Eof,
    Close,
}

enum UpstreamOp {
    Data(Bytes),
    Eof,
    Request(RelayRequest),
}

/// Ensures both sides of a proxied channel are closed exactly once no
/// matter which of {downstream close, upstream close, byte-copy EOF, request
/// stream closed} triggers teardown first.
struct CloseOnce {
    done: AtomicBool,
}

impl CloseOnce {
    fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
        }
    }

    /// Returns `true` the first time it's called; every subsequent call is
    /// a no-op that returns `false`.
    fn fire(&self) -> bool {
        self.done
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Byte-stream and request-stream pump between the downstream session
/// channel and the matching upstream channel, with single-shot close.
///
/// Two copy directions race a request multiplexer; whichever finishes first
/// tears down both sides. A single background task owns the upstream
/// `Channel<Msg>` and multiplexes outgoing ops against `channel.wait()`
/// internally, rather than two independent tasks reading the same channel
/// concurrently; the calling task owns the downstream side and the request
/// queues.
pub struct BidiProxy;

impl BidiProxy {
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        upstream_channel: Channel<Msg>,
        downstream_handle: Handle,
        downstream_channel_id: ServerChannelId,
        mut downstream_events: mpsc::UnboundedReceiver<DownstreamEvent>,
        mut relay_requests: mpsc::Receiver<RelayRequest>,
        recorder: Arc<RecordingChannel>,
    ) {
        let close_once = Arc::new(CloseOnce::new());
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (closer_tx, mut closer_rx) = mpsc::channel::<()>(2);

        let upstream_task = tokio::spawn(run_upstream_pump(
            upstream_channel,
            ops_rx,
            downstream_handle.clone(),
            downstream_channel_id,
            recorder.clone(),
            closer_tx,
            close_once.clone(),
        ));

        loop {
            tokio::select! {
                event = downstream_events.recv() => {
                    match event {
                        None | Some(DownstreamEvent::Close) => break,
                        Some(DownstreamEvent::Eof) => {
                            let _ = ops_tx.send(UpstreamOp::Eof);
                        }
                        Some(DownstreamEvent::Data(data)) | Some(DownstreamEvent::ExtendedData(data, _)) => {
                            let _ = ops_tx.send(UpstreamOp::Data(data));
                        }
                    }
                }
                request = relay_requests.recv() => {
                    match request {
                        None => break,
                        Some(relay_request) => {
                            recorder.log_request(&render_relay_request(&relay_request)).await;
                            let _ = ops_tx.send(UpstreamOp::Request(relay_request));
                        }
                    }
                }
                _ = closer_rx.recv() => break,
            }
        }

        drop(ops_tx);
        if close_once.fire() {
            let _ = downstream_handle.close(downstream_channel_id.0).await;
        }
        let _ = upstream_task.await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_upstream_pump(
    mut channel: Channel<Msg>,
    mut ops_rx: mpsc::UnboundedReceiver<UpstreamOp>,
    downstream_handle: Handle,
    downstream_channel_id: ServerChannelId,
    recorder: Arc<RecordingChannel>,
    closer_tx: mpsc::Sender<()>,
    close_once: Arc<CloseOnce>,
) {
    let mut pending_replies: VecDeque<oneshot::Sender<bool>> = VecDeque::new();

    loop {
        tokio::select! {
            op = ops_rx.recv() => {
                match op {
                    None => break,
                    Some(UpstreamOp::Data(data)) => {
                        if let Err(error) = channel.data(&data[..]).await {
                            debug!(%error, "failed forwarding data upstream");
                            break;
                        }
                    }
                    Some(UpstreamOp::Eof) => {
                        let _ = channel.eof().await;
                    }
                    Some(UpstreamOp::Request(request)) => {
                        if let Some(reply_tx) = request.reply_tx {
                            pending_replies.push_back(reply_tx);
                        }
                        send_relay_payload(&channel, request.payload).await;
                    }
                }
            }
            event = channel.wait() => {
                match event {
                    None => {
                        let _ = closer_tx.send(()).await;
                        break;
                    }
                    Some(ChannelMsg::Data { data }) => {
                        recorder.write(&data).await;
                        let bytes = CryptoVec::from(data.to_vec());
                        let _ = downstream_handle.data(downstream_channel_id.0, bytes).await;
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        recorder.write(&data).await;
                        let bytes = CryptoVec::from(data.to_vec());
                        let _ = downstream_handle.extended_data(downstream_channel_id.0, ext, bytes).await;
                    }
                    Some(ChannelMsg::Eof) => {
                        let _ = downstream_handle.eof(downstream_channel_id.0).await;
                    }
                    Some(ChannelMsg::Close) => {
                        if close_once.fire() {
                            let _ = downstream_handle.close(downstream_channel_id.0).await;
                        }
                        let _ = closer_tx.send(()).await;
                        break;
                    }
                    Some(ChannelMsg::Success) => {
                        if let Some(reply_tx) = pending_replies.pop_front() {
                            let _ = reply_tx.send(true);
                        }
                    }
                    Some(ChannelMsg::Failure) => {
                        if let Some(reply_tx) = pending_replies.pop_front() {
                            let _ = reply_tx.send(false);
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        let _ = downstream_handle.exit_status_request(downstream_channel_id.0, exit_status).await;
                    }
                    _ => {}
                }
            }
        }
    }

    while let Some(request) = ops_rx.recv().await {
        if let UpstreamOp::Request(request) = request {
            drop(request.reply_tx);
        }
    }
}

async fn send_relay_payload(channel: &Channel<Msg>, payload: RelayPayload) {
    let result = match payload {
        RelayPayload::PtyRequest(req) => {
            channel
                .request_pty(
                    false,
                    &req.term,
                    req.col_width,
                    req.row_height,
                    req.pix_width,
                    req.pix_height,
                    &req.modes,
                )
                .await
        }
        RelayPayload::Shell => channel.request_shell(false).await,
        RelayPayload::Exec(command) => channel.exec(true, command).await,
        RelayPayload::Env(name, value) => channel.set_env(false, name, value).await,
        RelayPayload::WindowChange(req) => {
            channel
                .window_change(req.col_width, req.row_height, req.pix_width, req.pix_height)
                .await
        }
        RelayPayload::Signal(signal) => channel.signal(signal).await,
        RelayPayload::Subsystem(name) => channel.request_subsystem(true, &name).await,
    };
    if let Err(error) = result {
        debug!(%error, "failed forwarding channel request upstream");
    }
}

fn render_relay_request(request: &RelayRequest) -> RequestEvent {
    let (request_type, want_reply, payload) = match &request.payload {
        RelayPayload::PtyRequest(req) => ("pty-req".to_owned(), false, req.term.clone().into_bytes()),
        RelayPayload::Shell => ("shell".to_owned(), false, Vec::new()),
        RelayPayload::Exec(command) => ("exec".to_owned(), true, encode_ssh_string(command)),
        RelayPayload::Env(name, value) => {
            let mut payload = encode_ssh_string(name);
            payload.extend(encode_ssh_string(value));
            ("env".to_owned(), false, payload)
        }
        RelayPayload::WindowChange(req) => (
            "window-change".to_owned(),
            false,
            format!("{}x{}", req.col_width, req.row_height).into_bytes(),
        ),
        RelayPayload::Signal(signal) => ("signal".to_owned(), false, format!("{signal:?}").into_bytes()),
        RelayPayload::Subsystem(name) => ("subsystem".to_owned(), true, encode_ssh_string(name)),
    };
    RequestEvent {
        request_type,
        want_reply,
        payload,
    }
}

fn encode_ssh_string(s: &str) -> Vec<u8> {
    let mut out = (s.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(s.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PtyRequest;

    #[test]
    fn close_once_fires_exactly_once() {
        let closer = CloseOnce::new();
        assert!(closer.fire());
        assert!(!closer.fire());
        assert!(!closer.fire());
    }

    #[test]
    fn encode_ssh_string_is_length_prefixed_big_endian() {
        let encoded = encode_ssh_string("scp");
        assert_eq!(encoded, [0, 0, 0, 3, b's', b'c', b'p']);
    }

    #[test]
    fn encode_ssh_string_round_trips_an_empty_string() {
        assert_eq!(encode_ssh_string(""), [0, 0, 0, 0]);
    }

    #[test]
    fn render_relay_request_marks_exec_as_wanting_a_reply() {
        let event = render_relay_request(&RelayRequest {
            payload: RelayPayload::Exec("scp -t /tmp".to_owned()),
            reply_tx: None,
        });

        assert_eq!(event.request_type, "exec");
        assert!(event.want_reply);
        assert_eq!(event.payload, encode_ssh_string("scp -t /tmp"));
    }

    #[test]
    fn render_relay_request_shell_never_wants_a_reply() {
        let event = render_relay_request(&RelayRequest {
            payload: RelayPayload::Shell,
            reply_tx: None,
        });

        assert_eq!(event.request_type, "shell");
        assert!(!event.want_reply);
    }

    #[test]
    fn render_relay_request_env_concatenates_name_and_value() {
        let event = render_relay_request(&RelayRequest {
            payload: RelayPayload::Env("LANG".to_owned(), "en_US.UTF-8".to_owned()),
            reply_tx: None,
        });

        let mut expected = encode_ssh_string("LANG");
        expected.extend(encode_ssh_string("en_US.UTF-8"));
        assert_eq!(event.payload, expected);
        assert!(!event.want_reply);
    }

    #[test]
    fn render_relay_request_pty_uses_the_term_name_as_payload() {
        let event = render_relay_request(&RelayRequest {
            payload: RelayPayload::PtyRequest(PtyRequest {
                term: "xterm-256color".to_owned(),
                col_width: 80,
                row_height: 24,
                pix_width: 0,
                pix_height: 0,
                modes: Vec::new(),
            }),
            reply_tx: None,
        });

        assert_eq!(event.request_type, "pty-req");
        assert_eq!(event.payload, b"xterm-256color");
    }
}
