use std::path::{Path, PathBuf};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::debug;

use bastion_common::fs::{secure_directory, secure_file};

use super::artifact::Artifact;
use super::ttyrec;

/// A single SSH channel request as observed by the relay, in either
/// direction.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub request_type: String,
    pub want_reply: bool,
    pub payload: Vec<u8>,
}

/// Decodes one length-prefixed SSH string from the front of `buf`, returning
/// the decoded text and the remaining bytes.
fn take_ssh_string(buf: &[u8]) -> Option<(&str, &[u8])> {
    if buf.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes(buf[0..4].try_into().ok()?) as usize;
    let rest = &buf[4..];
    if rest.len() < len {
        return None;
    }
    let s = std::str::from_utf8(&rest[..len]).ok()?;
    Some((s, &rest[len..]))
}

fn render_env(payload: &[u8]) -> String {
    match take_ssh_string(payload).and_then(|(name, rest)| {
        take_ssh_string(rest).map(|(value, _)| format!("name: {name}, value: {value}"))
    }) {
        Some(rendered) => rendered,
        None => format!("{:?}", payload),
    }
}

/// Renders an `exec` payload to its bare command string, and reports whether
/// it should trigger the file-transfer suppression rule (`unlogged`): the
/// first whitespace-delimited token is `scp` or `rsync`.
fn render_exec(payload: &[u8]) -> (String, bool) {
    match take_ssh_string(payload) {
        Some((command, _)) => {
            let suppress = command
                .split_whitespace()
                .next()
                .map(|first| first == "scp" || first == "rsync")
                .unwrap_or(false);
            (command.to_owned(), suppress)
        }
        None => (format!("{:?}", payload), false),
    }
}

struct State {
    raw: Artifact,
    ttyrec: Artifact,
    req: Artifact,
    unlogged: bool,
}

/// Transparent interposer on the downstream session channel.
///
/// Every byte written toward the user is tee'd into the raw log and a
/// ttyrec-framed log before being forwarded; every channel request observed
/// in either direction is rendered into the request log. Buffering defers
/// all three artifacts' filesystem I/O until `sync_to_file` is called, so
/// that banners printed before the upstream dial completes are never lost.
///
/// Generic over nothing: this type owns no connection to the transport at
/// all. `SessionRelay`/`BidiProxy` call `write` to tee+record bytes they are
/// about to forward themselves, and `log_request` for every request they
/// observe; the actual forwarding happens in the caller. This keeps the
/// recording pipeline testable without a live SSH channel.
pub struct RecordingChannel {
    state: Mutex<State>,
    log_root: PathBuf,
    user_name: String,
    start_time: OffsetDateTime,
}

impl RecordingChannel {
    pub fn new(log_root: impl Into<PathBuf>, user_name: impl Into<String>, start_time: OffsetDateTime) -> Self {
        Self {
            state: Mutex::new(State {
                raw: Artifact::pending(),
                ttyrec: Artifact::pending(),
                req: Artifact::pending(),
                unlogged: false,
            }),
            log_root: log_root.into(),
            user_name: user_name.into(),
            start_time,
        }
    }

    fn base_path(&self, sanitized_host: &str) -> PathBuf {
        self.log_root.join(sanitized_host).join(&self.user_name)
    }

    fn log_filename(&self) -> String {
        let stamp = self
            .start_time
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.start_time.unix_timestamp().to_string());
        format!("ssh_log_{stamp}")
    }

    /// Creates the per-session directory and opens (or re-opens) the three
    /// artifact files, flushing whatever was buffered before now. Idempotent:
    /// calling it a second time is a no-op: the buffered -> synced
    /// transition only ever runs once.
    pub async fn sync_to_file(&self, sanitized_host: &str) -> std::io::Result<()> {
        let dir = self.base_path(sanitized_host);
        tokio::fs::create_dir_all(&dir).await?;
        secure_directory(&dir)?;

        let base = dir.join(self.log_filename());
        let raw_path = base.clone();
        let ttyrec_path = path_with_suffix(&base, ".ttyrec");
        let req_path = path_with_suffix(&base, ".req");

        let mut state = self.state.lock().await;
        state.raw.sync_to_file(&raw_path).await?;
        state.ttyrec.sync_to_file(&ttyrec_path).await?;
        state.req.sync_to_file(&req_path).await?;
        drop(state);

        for path in [&raw_path, &ttyrec_path, &req_path] {
            secure_file(path)?;
        }

        Ok(())
    }

    /// Records `data` as bound for the downstream user. Unlike the
    /// underlying forward, this never fails the session on write error: a
    /// lost recording byte is logged and swallowed rather than tearing down
    /// an otherwise-healthy proxy.
    pub async fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().await;
        if state.unlogged {
            return;
        }
        if let Err(error) = state.raw.write(data).await {
            debug!(%error, "failed to write raw session log");
        }
        let header = ttyrec::frame_header(now, data.len());
        if let Err(error) = state.ttyrec.write(&header).await {
            debug!(%error, "failed to write ttyrec frame header");
        }
        if let Err(error) = state.ttyrec.write(data).await {
            debug!(%error, "failed to write ttyrec frame body");
        }
    }

    /// Renders and appends one request-log line; flips `unlogged` when an
    /// `exec` command is an scp/rsync invocation. Always recorded, even
    /// after `unlogged` has suppressed the raw/ttyrec artifacts.
    pub async fn log_request(&self, event: &RequestEvent) {
        let (rendered, suppress) = match event.request_type.as_str() {
            "env" => (render_env(&event.payload), false),
            "exec" => render_exec(&event.payload),
            _ => (format!("{:?}", event.payload), false),
        };

        let now = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown-time".to_owned());
        let line = format!(
            "{now}: Request Type - {} - Want Reply: {} - Payload: {rendered}\r\n",
            event.request_type, event.want_reply
        );

        let mut state = self.state.lock().await;
        if let Err(error) = state.req.write(line.as_bytes()).await {
            debug!(%error, "failed to write request log line");
        }
        if suppress {
            state.unlogged = true;
        }
    }

    pub async fn is_unlogged(&self) -> bool {
        self.state.lock().await.unlogged
    }

    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        let _ = state.raw.flush().await;
        let _ = state.ttyrec.flush().await;
        let _ = state.req.flush().await;
    }
}

fn path_with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut s = base.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_ssh_string(s: &str) -> Vec<u8> {
        let mut out = (s.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(s.as_bytes());
        out
    }

    #[tokio::test]
    async fn raw_and_ttyrec_agree_on_total_length() {
        let dir = tempfile::tempdir().unwrap();
        let channel = RecordingChannel::new(dir.path(), "alice", OffsetDateTime::now_utc());

        channel.write(b"hello ").await;
        channel.write(b"world").await;
        channel.sync_to_file("example.com").await.unwrap();
        channel.write(b"!").await;
        channel.close().await;

        let raw_path = dir
            .path()
            .join("example.com")
            .join("alice");
        let entries: Vec<_> = std::fs::read_dir(&raw_path).unwrap().collect();
        assert_eq!(entries.len(), 3);

        let raw_file = entries
            .iter()
            .find_map(|e| {
                let e = e.as_ref().unwrap();
                let name = e.file_name().into_string().unwrap();
                (!name.ends_with(".ttyrec") && !name.ends_with(".req")).then(|| e.path())
            })
            .unwrap();
        let raw = std::fs::read(raw_file).unwrap();
        assert_eq!(raw, b"hello world!");

        let ttyrec_file = entries
            .iter()
            .find_map(|e| {
                let e = e.as_ref().unwrap();
                let name = e.file_name().into_string().unwrap();
                name.ends_with(".ttyrec").then(|| e.path())
            })
            .unwrap();
        let ttyrec = std::fs::read(ttyrec_file).unwrap();

        let mut total_payload = 0usize;
        let mut offset = 0usize;
        while offset < ttyrec.len() {
            let length = i32::from_le_bytes(ttyrec[offset + 8..offset + 12].try_into().unwrap()) as usize;
            total_payload += length;
            offset += 12 + length;
        }
        assert_eq!(total_payload, raw.len());
    }

    #[tokio::test]
    async fn scp_exec_suppresses_subsequent_writes() {
        let dir = tempfile::tempdir().unwrap();
        let channel = RecordingChannel::new(dir.path(), "bob", OffsetDateTime::now_utc());
        channel.sync_to_file("host").await.unwrap();

        channel
            .log_request(&RequestEvent {
                request_type: "exec".to_owned(),
                want_reply: false,
                payload: encode_ssh_string("scp -t /tmp/foo"),
            })
            .await;
        assert!(channel.is_unlogged().await);

        channel.write(b"should not appear").await;
        channel.close().await;

        let raw_path = dir.path().join("host").join("bob");
        let raw_file = std::fs::read_dir(&raw_path)
            .unwrap()
            .find_map(|e| {
                let e = e.unwrap();
                let name = e.file_name().into_string().unwrap();
                (!name.ends_with(".ttyrec") && !name.ends_with(".req")).then(|| e.path())
            })
            .unwrap();
        assert_eq!(std::fs::read(raw_file).unwrap(), b"");
    }

    #[tokio::test]
    async fn env_request_renders_name_and_value() {
        let dir = tempfile::tempdir().unwrap();
        let channel = RecordingChannel::new(dir.path(), "carol", OffsetDateTime::now_utc());
        channel.sync_to_file("host").await.unwrap();

        let mut payload = encode_ssh_string("LANG");
        payload.extend(encode_ssh_string("en_US.UTF-8"));
        channel
            .log_request(&RequestEvent {
                request_type: "env".to_owned(),
                want_reply: false,
                payload,
            })
            .await;
        channel.close().await;

        let req_path = dir.path().join("host").join("carol");
        let req_file = std::fs::read_dir(&req_path)
            .unwrap()
            .find_map(|e| {
                let e = e.unwrap();
                let name = e.file_name().into_string().unwrap();
                name.ends_with(".req").then(|| e.path())
            })
            .unwrap();
        let content = std::fs::read_to_string(req_file).unwrap();
        assert!(content.contains("name: LANG, value: en_US.UTF-8"));
    }
}
