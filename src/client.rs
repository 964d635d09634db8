//! Async client for the picshare protocol
//!
//! A background reader splits the server's output three ways: events go to
//! the event queue, responses to the response queue and binary frames to the
//! payload queue. Commands then wait only on the queue they care about, so a
//! broadcast arriving mid-command never confuses a reply.

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::protocol::{cmd, Event, Listing, RawCommand, Response, ServerMessage, TransferMode};

// How long to wait for any single reply or payload frame
pub const REPLY_TIMEOUT_MS: u64 = 30_000;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct ShareClient {
    sink: WsSink,
    responses: mpsc::UnboundedReceiver<Response>,
    payloads: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedReceiver<Event>,
    reader: JoinHandle<()>,
}

impl ShareClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let mut config = WebSocketConfig::default();
        config.max_message_size = None;
        config.max_frame_size = None;
        let (ws, _) = tokio_tungstenite::connect_async_with_config(url, Some(config), true)
            .await
            .with_context(|| format!("connect {url}"))?;
        let (sink, mut stream) = ws.split();

        let (resp_tx, responses) = mpsc::unbounded_channel();
        let (bin_tx, payloads) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(ServerMessage::Event(ev)) => {
                            let _ = event_tx.send(ev);
                        }
                        Ok(ServerMessage::Response(resp)) => {
                            let _ = resp_tx.send(resp);
                        }
                        Err(e) => debug!(error = %e, "unrecognised server message"),
                    },
                    Ok(Message::Binary(data)) => {
                        let _ = bin_tx.send(data);
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "connection error");
                        break;
                    }
                }
            }
        });

        Ok(ShareClient {
            sink,
            responses,
            payloads,
            events,
            reader,
        })
    }

    /// Send a command without waiting for its reply.
    pub async fn send_command(&mut self, command: &RawCommand) -> Result<()> {
        let text = serde_json::to_string(command)?;
        self.sink
            .send(Message::Text(text.into()))
            .await
            .context("send command")
    }

    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(Message::Text(text.to_owned().into()))
            .await
            .context("send text")
    }

    pub async fn send_binary(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.sink
            .send(Message::Binary(data.into()))
            .await
            .context("send file data")
    }

    pub async fn recv_response(&mut self) -> Result<Response> {
        match timeout(Duration::from_millis(REPLY_TIMEOUT_MS), self.responses.recv()).await {
            Ok(Some(resp)) => Ok(resp),
            Ok(None) => bail!("connection closed"),
            Err(_) => bail!("reply timeout ({} ms)", REPLY_TIMEOUT_MS),
        }
    }

    pub async fn recv_payload(&mut self) -> Result<Bytes> {
        match timeout(Duration::from_millis(REPLY_TIMEOUT_MS), self.payloads.recv()).await {
            Ok(Some(data)) => Ok(data),
            Ok(None) => bail!("connection closed"),
            Err(_) => bail!("payload timeout ({} ms)", REPLY_TIMEOUT_MS),
        }
    }

    /// Send a command and wait for the reply, whatever its status.
    pub async fn command(&mut self, command: &RawCommand) -> Result<Response> {
        self.send_command(command).await?;
        self.recv_response().await
    }

    pub async fn auth(&mut self, username: &str) -> Result<Response> {
        let resp = self.command(&RawCommand::new(cmd::AUTH, &[username])).await?;
        expect_success(resp)
    }

    pub async fn list(&mut self) -> Result<Vec<Listing>> {
        match self.command(&RawCommand::new(cmd::LIST, &[])).await? {
            Response::Success { data, .. } => Ok(data.unwrap_or_default()),
            other => Err(unexpected(other)),
        }
    }

    /// Upload one file; returns the id the server assigned.
    pub async fn upload(&mut self, filename: &str, data: impl Into<Bytes>) -> Result<u64> {
        let data = data.into();
        let size = data.len().to_string();
        match self
            .command(&RawCommand::new(cmd::UPLOAD, &[filename, &size]))
            .await?
        {
            Response::Ready { .. } => {}
            other => return Err(unexpected(other)),
        }
        self.send_binary(data).await?;
        match self.recv_response().await? {
            Response::Success { id: Some(id), .. } => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub async fn download(&mut self, filename: &str) -> Result<Bytes> {
        self.fetch(filename, TransferMode::Download).await
    }

    pub async fn view(&mut self, filename: &str) -> Result<Bytes> {
        self.fetch(filename, TransferMode::View).await
    }

    async fn fetch(&mut self, filename: &str, mode: TransferMode) -> Result<Bytes> {
        let size = match self
            .command(&RawCommand::new(mode.as_str(), &[filename]))
            .await?
        {
            Response::SizeInfo { size, .. } => size,
            other => return Err(unexpected(other)),
        };
        let data = self.recv_payload().await?;
        expect_success(self.recv_response().await?)?;
        if data.len() as u64 != size {
            bail!("received {} bytes, expected {}", data.len(), size);
        }
        Ok(data)
    }

    /// Say goodbye and close the connection.
    pub async fn disconnect(mut self) -> Result<Response> {
        let resp = self.command(&RawCommand::new(cmd::DISCONNECT, &[])).await?;
        let _ = self.sink.close().await;
        Ok(resp)
    }

    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Wait up to `ms` for the next event.
    pub async fn next_event_within(&mut self, ms: u64) -> Option<Event> {
        timeout(Duration::from_millis(ms), self.events.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn try_next_event(&mut self) -> Option<Event> {
        self.events.try_recv().ok()
    }
}

impl Drop for ShareClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn expect_success(resp: Response) -> Result<Response> {
    if resp.is_success() {
        Ok(resp)
    } else {
        Err(unexpected(resp))
    }
}

fn unexpected(resp: Response) -> anyhow::Error {
    match resp {
        Response::Error { message } => anyhow!("server error: {message}"),
        other => anyhow!("unexpected reply: {other:?}"),
    }
}
