//! Per-connection command loop
//!
//! A session moves through `Unauthenticated -> Active -> [AwaitingUploadPayload]
//! -> Active -> ... -> Closed`. Only `Active` may list, fetch or start an
//! upload; only `AwaitingUploadPayload` consumes a binary frame. Everything
//! short of a connection fault is answered with ERROR and the loop goes on.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::Broadcaster;
use crate::config::Limits;
use crate::error::{CommandError, SessionError, TransferError};
use crate::framing::{validate_declared_size, validate_filename, Frame, Outbound, Outbox, PendingUpload};
use crate::protocol::{Command, Event, Response, TransferMode, ANONYMOUS};
use crate::store::MetadataStore;

/// Shared services handed to every session
#[derive(Clone)]
pub struct Services {
    pub store: Arc<MetadataStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub limits: Limits,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Active { username: String },
    AwaitingUploadPayload { username: String, upload: PendingUpload },
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

pub struct Session {
    id: Uuid,
    peer: String,
    state: SessionState,
    outbox: Outbox,
    services: Services,
    /// One DOWNLOAD/VIEW payload queued or being written at a time
    transfers: Arc<Semaphore>,
}

impl Session {
    pub fn new(id: Uuid, peer: impl Into<String>, outbox: Outbox, services: Services) -> Self {
        Session {
            id,
            peer: peer.into(),
            state: SessionState::Unauthenticated,
            outbox,
            services,
            transfers: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn username(&self) -> &str {
        match &self.state {
            SessionState::Active { username }
            | SessionState::AwaitingUploadPayload { username, .. } => username,
            SessionState::Unauthenticated | SessionState::Closed => ANONYMOUS,
        }
    }

    fn awaiting_payload(&self) -> bool {
        matches!(self.state, SessionState::AwaitingUploadPayload { .. })
    }

    /// Drive the session until DISCONNECT, end of stream or a transport error.
    pub async fn run<S, E>(mut self, mut inbound: S) -> Result<(), SessionError>
    where
        S: Stream<Item = Result<Frame, E>> + Unpin,
        E: Display,
    {
        let result = loop {
            let next = match (self.awaiting_payload(), self.services.limits.payload_timeout) {
                (true, Some(limit)) => match tokio::time::timeout(limit, inbound.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        if let Err(e) = self.abort_upload(TransferError::TimedOut).await {
                            break Err(e);
                        }
                        continue;
                    }
                },
                _ => inbound.next().await,
            };
            match next {
                None => break Ok(()),
                Some(Err(e)) => {
                    debug!(peer = %self.peer, error = %e, "transport error");
                    break Ok(());
                }
                Some(Ok(frame)) => match self.handle_frame(frame).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Close) => break Ok(()),
                    Err(e) => break Err(e),
                },
            }
        };
        self.state = SessionState::Closed;
        result
    }

    /// Process one inbound frame. Only connection faults come back as errors.
    pub async fn handle_frame(&mut self, frame: Frame) -> Result<Flow, SessionError> {
        let outcome = match std::mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::AwaitingUploadPayload { username, upload } => {
                self.state = SessionState::Active {
                    username: username.clone(),
                };
                self.finish_upload(&username, upload, frame).await
            }
            state => {
                self.state = state;
                match frame {
                    Frame::Binary(data) => {
                        debug!(peer = %self.peer, bytes = data.len(), "binary frame outside a transfer, dropped");
                        Ok(Flow::Continue)
                    }
                    Frame::Text(text) => match Command::parse(&text) {
                        Ok(cmd) => {
                            info!(session = %self.id, peer = %self.peer, user = %self.username(), cmd = cmd.name(), "command");
                            self.execute(cmd).await
                        }
                        Err(e) => Err(e.into()),
                    },
                }
            }
        };

        match outcome {
            Err(SessionError::Command(e)) => {
                debug!(peer = %self.peer, error = %e, "command failed");
                self.reply(&Response::error(e.user_message())).await?;
                Ok(Flow::Continue)
            }
            other => other,
        }
    }

    async fn execute(&mut self, cmd: Command) -> Result<Flow, SessionError> {
        match cmd {
            Command::Auth { username } => {
                self.reply(&Response::success(format!("authenticated as {username}")))
                    .await?;
                self.state = SessionState::Active { username };
                if let Some(batch) = self.services.broadcaster.replay() {
                    self.send(Outbound::json(&batch)).await?;
                }
                Ok(Flow::Continue)
            }
            Command::List => {
                self.require_active()?;
                let data = self.services.store.listing().await;
                self.reply(&Response::listing(data)).await?;
                Ok(Flow::Continue)
            }
            Command::Upload { filename, size } => {
                let username = self.require_active()?;
                validate_filename(&filename)?;
                validate_declared_size(size, self.services.limits.max_upload_bytes)
                    .map_err(CommandError::BadArguments)?;
                self.state = SessionState::AwaitingUploadPayload {
                    username,
                    upload: PendingUpload { filename, size },
                };
                self.reply(&Response::ready()).await?;
                Ok(Flow::Continue)
            }
            Command::Fetch { filename, mode } => {
                self.require_active()?;
                self.fetch(filename, mode).await?;
                Ok(Flow::Continue)
            }
            Command::Disconnect => {
                let message = format!("client {} disconnecting", self.username());
                self.reply(&Response::Bye { message }).await?;
                self.state = SessionState::Closed;
                Ok(Flow::Close)
            }
        }
    }

    fn require_active(&self) -> Result<String, CommandError> {
        match &self.state {
            SessionState::Active { username } => Ok(username.clone()),
            _ => Err(CommandError::NotAuthenticated),
        }
    }

    async fn finish_upload(
        &mut self,
        username: &str,
        upload: PendingUpload,
        frame: Frame,
    ) -> Result<Flow, SessionError> {
        let data = upload.accept(frame)?;
        let record = match self
            .services
            .store
            .insert(&upload.filename, username, &data)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "upload not committed");
                return Err(e.into());
            }
        };
        info!(
            peer = %self.peer,
            user = %username,
            id = record.id,
            filename = %record.filename,
            bytes = data.len(),
            "upload committed"
        );
        self.reply(&Response::uploaded(&record.filename, record.id))
            .await?;

        let report = self
            .services
            .broadcaster
            .publish(Event::new_upload(&record.filename, username));
        if report.failed.is_empty() {
            debug!(delivered = report.delivered, "upload broadcast");
        } else {
            warn!(
                delivered = report.delivered,
                failed = report.failed.len(),
                "upload broadcast partially failed"
            );
        }
        Ok(Flow::Continue)
    }

    async fn abort_upload(&mut self, reason: TransferError) -> Result<(), SessionError> {
        match std::mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::AwaitingUploadPayload { username, upload } => {
                warn!(peer = %self.peer, filename = %upload.filename, error = %reason, "upload aborted");
                self.state = SessionState::Active { username };
                self.reply(&Response::error(CommandError::from(reason).user_message()))
                    .await
            }
            other => {
                self.state = other;
                Ok(())
            }
        }
    }

    async fn fetch(&mut self, filename: String, mode: TransferMode) -> Result<(), SessionError> {
        let record = self
            .services
            .store
            .query_by_filename(&filename)
            .await
            .ok_or_else(|| CommandError::NotFound(filename.clone()))?;

        // Waits for the writer to finish the previous payload, so a session
        // never holds more than one file in memory for sending.
        let slot = self
            .transfers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SessionError::ConnectionClosed)?;
        let data = match tokio::fs::read(&record.storage_path).await {
            Ok(data) => data,
            Err(e) => {
                warn!(id = record.id, error = %e, "stored file unreadable");
                return Err(TransferError::Unavailable.into());
            }
        };
        let header = Response::SizeInfo {
            size: data.len() as u64,
            filename: filename.clone(),
            mode,
        };
        self.send(Outbound::transfer(&header, Bytes::from(data), slot))
            .await?;
        self.reply(&Response::success(format!("transfer of {filename} complete")))
            .await
    }

    async fn reply(&self, response: &Response) -> Result<(), SessionError> {
        self.send(Outbound::json(response)).await
    }

    async fn send(&self, out: Outbound) -> Result<(), SessionError> {
        self.outbox
            .send(out)
            .await
            .map_err(|_| SessionError::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use crate::thumbnail::NoopThumbnailer;
    use std::convert::Infallible;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Harness {
        _dir: TempDir,
        services: Services,
        registry: Arc<SessionRegistry>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_limits(Limits::default())
        }

        fn with_limits(limits: Limits) -> Self {
            let dir = TempDir::new().unwrap();
            let store = MetadataStore::open(
                &dir.path().join("imagens"),
                &dir.path().join("metadata.json"),
                Arc::new(NoopThumbnailer),
            )
            .unwrap();
            let registry = SessionRegistry::new();
            let services = Services {
                store: Arc::new(store),
                broadcaster: Arc::new(Broadcaster::new(registry.clone(), 5)),
                limits,
            };
            Harness {
                _dir: dir,
                services,
                registry,
            }
        }

        fn session(&self) -> (Session, mpsc::Receiver<Outbound>) {
            let (tx, rx) = mpsc::channel(64);
            (
                Session::new(Uuid::new_v4(), "test", tx, self.services.clone()),
                rx,
            )
        }
    }

    fn text(cmd: &str, args: &[&str]) -> Frame {
        Frame::Text(serde_json::to_string(&crate::protocol::RawCommand::new(cmd, args)).unwrap())
    }

    fn next_json(rx: &mut mpsc::Receiver<Outbound>) -> serde_json::Value {
        match rx.try_recv() {
            Ok(Outbound::Text(t)) => serde_json::from_str(&t).unwrap(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    async fn authed(h: &Harness, name: &str) -> (Session, mpsc::Receiver<Outbound>) {
        let (mut s, mut rx) = h.session();
        s.handle_frame(text("AUTH", &[name])).await.unwrap();
        assert_eq!(next_json(&mut rx)["status"], "SUCCESS");
        (s, rx)
    }

    #[tokio::test]
    async fn test_commands_require_auth() {
        let h = Harness::new();
        let (mut s, mut rx) = h.session();
        for cmd in ["LIST", "DOWNLOAD", "VIEW"] {
            let args: &[&str] = if cmd == "LIST" { &[] } else { &["a.png"] };
            s.handle_frame(text(cmd, args)).await.unwrap();
            let v = next_json(&mut rx);
            assert_eq!(v["status"], "ERROR");
            assert_eq!(v["message"], "authenticate first");
        }
        s.handle_frame(text("UPLOAD", &["a.png", "1"])).await.unwrap();
        assert_eq!(next_json(&mut rx)["status"], "ERROR");
        assert_eq!(*s.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_are_not_fatal() {
        let h = Harness::new();
        let (mut s, mut rx) = authed(&h, "alice").await;
        assert_eq!(s.handle_frame(Frame::Text("{oops".into())).await.unwrap(), Flow::Continue);
        let v = next_json(&mut rx);
        assert_eq!(v["status"], "ERROR");
        assert!(v["message"].as_str().unwrap().starts_with("invalid format"));

        s.handle_frame(text("RENAME", &["a", "b"])).await.unwrap();
        let v = next_json(&mut rx);
        assert!(v["message"].as_str().unwrap().starts_with("unknown command"));
        assert_eq!(s.username(), "alice");
    }

    #[tokio::test]
    async fn test_stray_binary_is_dropped_silently() {
        let h = Harness::new();
        let (mut s, mut rx) = authed(&h, "alice").await;
        let flow = s.handle_frame(Frame::Binary(Bytes::from_static(b"junk"))).await.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert!(rx.try_recv().is_err());
        assert!(h.services.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_upload_then_download_round_trip() {
        let h = Harness::new();
        let (mut alice, mut rx) = authed(&h, "alice").await;
        let _reg = h.registry.register(alice.outbox.clone());

        alice.handle_frame(text("UPLOAD", &["cat.png", "10"])).await.unwrap();
        assert_eq!(next_json(&mut rx)["status"], "READY");
        assert!(matches!(alice.state(), SessionState::AwaitingUploadPayload { .. }));

        let payload = Bytes::from((0u8..10).collect::<Vec<u8>>());
        alice.handle_frame(Frame::Binary(payload.clone())).await.unwrap();
        let v = next_json(&mut rx);
        assert_eq!(v["status"], "SUCCESS");
        assert_eq!(v["id"], 1);
        let ev = next_json(&mut rx);
        assert_eq!(ev["event"], "NEW_UPLOAD");
        assert_eq!(ev["filename"], "cat.png");
        assert_eq!(ev["uploader"], "alice");
        assert_eq!(*alice.state(), SessionState::Active { username: "alice".into() });

        let (mut bob, mut brx) = authed(&h, "bob").await;
        // History replay follows AUTH
        assert_eq!(next_json(&mut brx)["event"], "HISTORY");

        bob.handle_frame(text("DOWNLOAD", &["cat.png"])).await.unwrap();
        match brx.try_recv().unwrap() {
            Outbound::Transfer { header, payload: got, .. } => {
                let v: serde_json::Value = serde_json::from_str(&header).unwrap();
                assert_eq!(v["status"], "SIZE_INFO");
                assert_eq!(v["size"], 10);
                assert_eq!(v["mode"], "DOWNLOAD");
                assert_eq!(got, payload);
            }
            other => panic!("expected transfer, got {other:?}"),
        }
        assert_eq!(next_json(&mut brx)["status"], "SUCCESS");
    }

    #[tokio::test]
    async fn test_size_mismatch_creates_no_record() {
        let h = Harness::new();
        let (mut s, mut rx) = authed(&h, "alice").await;
        s.handle_frame(text("UPLOAD", &["cat.png", "10"])).await.unwrap();
        assert_eq!(next_json(&mut rx)["status"], "READY");
        s.handle_frame(Frame::Binary(Bytes::from_static(b"short"))).await.unwrap();
        let v = next_json(&mut rx);
        assert_eq!(v["status"], "ERROR");
        assert!(h.services.store.is_empty().await);
        assert_eq!(*s.state(), SessionState::Active { username: "alice".into() });
        assert!(h.services.broadcaster.history().is_empty());
    }

    #[tokio::test]
    async fn test_text_instead_of_payload_aborts_upload() {
        let h = Harness::new();
        let (mut s, mut rx) = authed(&h, "alice").await;
        s.handle_frame(text("UPLOAD", &["cat.png", "3"])).await.unwrap();
        next_json(&mut rx);
        // The LIST is consumed as the (wrong) payload frame, not dispatched
        s.handle_frame(text("LIST", &[])).await.unwrap();
        let v = next_json(&mut rx);
        assert_eq!(v["status"], "ERROR");
        assert!(rx.try_recv().is_err());
        assert!(h.services.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_upload_arguments() {
        let h = Harness::new();
        let (mut s, mut rx) = authed(&h, "alice").await;
        for args in [&["x.png", "abc"][..], &["x.png"][..], &["../x.png", "1"][..]] {
            s.handle_frame(text("UPLOAD", args)).await.unwrap();
            assert_eq!(next_json(&mut rx)["status"], "ERROR");
            assert!(!matches!(s.state(), SessionState::AwaitingUploadPayload { .. }));
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_oversized_upload_rejected_before_ready() {
        let h = Harness::with_limits(Limits {
            max_upload_bytes: 4,
            payload_timeout: None,
        });
        let (mut s, mut rx) = authed(&h, "alice").await;
        s.handle_frame(text("UPLOAD", &["big.png", "5"])).await.unwrap();
        let v = next_json(&mut rx);
        assert_eq!(v["status"], "ERROR");
        assert!(v["message"].as_str().unwrap().contains("too large"));
    }

    #[tokio::test]
    async fn test_download_missing_file() {
        let h = Harness::new();
        let (mut s, mut rx) = authed(&h, "bob").await;
        s.handle_frame(text("DOWNLOAD", &["missing.png"])).await.unwrap();
        let v = next_json(&mut rx);
        assert_eq!(v["status"], "ERROR");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_view_reports_mode() {
        let h = Harness::new();
        h.services.store.insert("a.png", "alice", b"abc").await.unwrap();
        let (mut s, mut rx) = authed(&h, "bob").await;
        s.handle_frame(text("VIEW", &["a.png"])).await.unwrap();
        match rx.try_recv().unwrap() {
            Outbound::Transfer { header, payload, .. } => {
                assert!(header.contains("\"mode\":\"VIEW\""));
                assert_eq!(&payload[..], b"abc");
            }
            other => panic!("expected transfer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_next_fetch_waits_for_writer() {
        let h = Harness::new();
        h.services.store.insert("a.png", "alice", b"abc").await.unwrap();
        let (mut s, mut rx) = authed(&h, "bob").await;

        s.handle_frame(text("DOWNLOAD", &["a.png"])).await.unwrap();
        let first = rx.try_recv().unwrap();
        assert!(matches!(first, Outbound::Transfer { .. }));
        assert_eq!(next_json(&mut rx)["status"], "SUCCESS");

        // First payload is still queued, so the second cannot be read yet
        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            s.handle_frame(text("DOWNLOAD", &["a.png"])),
        )
        .await;
        assert!(blocked.is_err());
        assert!(rx.try_recv().is_err());

        // Writer done with it
        drop(first);
        s.handle_frame(text("VIEW", &["a.png"])).await.unwrap();
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Transfer { .. }));
        assert_eq!(next_json(&mut rx)["status"], "SUCCESS");
    }

    #[tokio::test]
    async fn test_disconnect_says_bye() {
        let h = Harness::new();
        let (mut s, mut rx) = authed(&h, "alice").await;
        assert_eq!(s.handle_frame(text("DISCONNECT", &[])).await.unwrap(), Flow::Close);
        let v = next_json(&mut rx);
        assert_eq!(v["status"], "BYE");
        assert_eq!(*s.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_run_stops_on_disconnect() {
        let h = Harness::new();
        let (s, mut rx) = h.session();
        let frames = vec![
            Ok::<_, Infallible>(text("AUTH", &["alice"])),
            Ok(text("DISCONNECT", &[])),
            Ok(text("LIST", &[])),
        ];
        s.run(futures_util::stream::iter(frames)).await.unwrap();
        assert_eq!(next_json(&mut rx)["status"], "SUCCESS");
        assert_eq!(next_json(&mut rx)["status"], "BYE");
        // LIST after DISCONNECT is never processed
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_payload_timeout_returns_to_active() {
        let h = Harness::with_limits(Limits {
            max_upload_bytes: 1024,
            payload_timeout: Some(Duration::from_millis(20)),
        });
        let (s, mut rx) = h.session();
        let (tx, frames) = mpsc::unbounded_channel::<Result<Frame, Infallible>>();
        tx.send(Ok(text("AUTH", &["alice"]))).unwrap();
        tx.send(Ok(text("UPLOAD", &["slow.png", "4"]))).unwrap();
        let inbound = tokio_stream_from(frames);
        let task = tokio::spawn(s.run(inbound));

        tokio::time::sleep(Duration::from_millis(200)).await;
        // Payload shows up too late; it is now a stray frame
        tx.send(Ok(Frame::Binary(Bytes::from_static(b"late")))).unwrap();
        tx.send(Ok(text("LIST", &[]))).unwrap();
        drop(tx);
        task.await.unwrap().unwrap();

        let mut statuses = Vec::new();
        while let Ok(Outbound::Text(t)) = rx.try_recv() {
            let v: serde_json::Value = serde_json::from_str(&t).unwrap();
            statuses.push(v["status"].as_str().unwrap().to_string());
        }
        assert_eq!(statuses, ["SUCCESS", "READY", "ERROR", "SUCCESS"]);
        assert!(h.services.store.is_empty().await);
    }

    fn tokio_stream_from<T>(mut rx: mpsc::UnboundedReceiver<T>) -> impl Stream<Item = T> + Unpin {
        Box::pin(futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)))
    }
}
