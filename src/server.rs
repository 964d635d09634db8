//! WebSocket accept loop: one task per connection, one writer task per session

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::framing::{Frame, Outbound};
use crate::registry::SessionRegistry;
use crate::session::{Services, Session};
use crate::store::MetadataStore;
use crate::thumbnail::Thumbnailer;

pub struct Server {
    listener: TcpListener,
    services: Services,
    registry: Arc<SessionRegistry>,
    outbound_queue: usize,
}

impl Server {
    /// Open the metadata store and bind the listening socket. Either failing
    /// aborts startup.
    pub async fn bind(config: &ServerConfig, thumbnailer: Arc<dyn Thumbnailer>) -> Result<Self> {
        let store = MetadataStore::open(&config.storage_dir, &config.metadata_file, thumbnailer)
            .context("failed to load metadata store")?;
        let listener = TcpListener::bind(&config.bind)
            .await
            .with_context(|| format!("bind {}", config.bind))?;

        let registry = SessionRegistry::new();
        let broadcaster = Broadcaster::new(registry.clone(), config.history_capacity);
        Ok(Server {
            listener,
            services: Services {
                store: Arc::new(store),
                broadcaster: Arc::new(broadcaster),
                limits: config.limits,
            },
            registry,
            outbound_queue: config.outbound_queue.max(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "picshare daemon listening");
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let services = self.services.clone();
            let registry = self.registry.clone();
            let queue = self.outbound_queue;
            tokio::spawn(
                async move {
                    if let Err(e) = handle_connection(stream, peer, services, registry, queue).await {
                        debug!(error = %e, "connection ended with error");
                    }
                }
                .instrument(info_span!("conn", %peer)),
            );
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    services: Services,
    registry: Arc<SessionRegistry>,
    queue: usize,
) -> Result<()> {
    let mut ws_config = WebSocketConfig::default();
    let max = services.limits.max_message_size();
    ws_config.max_message_size = Some(max);
    ws_config.max_frame_size = Some(max);
    let ws = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config))
        .await
        .context("websocket handshake")?;
    let (mut sink, inbound) = ws.split();

    let (tx, mut rx) = mpsc::channel::<Outbound>(queue);
    let closer = tx.clone();
    let registration = registry.register(tx.clone());
    info!(session = %registration.id(), live = registry.len(), "connection opened");

    // Sole owner of the sink; drains replies, transfers and broadcasts in order
    let writer = tokio::spawn(
        async move {
            while let Some(mut out) = rx.recv().await {
                let last = matches!(out, Outbound::Close);
                // Released once the payload is handed to the socket
                let _slot = out.take_slot();
                for msg in out.into_messages() {
                    if let Err(e) = sink.send(msg).await {
                        debug!(error = %e, "send failed, dropping writer");
                        return;
                    }
                }
                if last {
                    break;
                }
            }
            let _ = sink.close().await;
        }
        .in_current_span(),
    );

    let inbound = inbound.filter_map(|msg| async move {
        match msg {
            Ok(msg) => Frame::from_message(msg).map(Ok),
            Err(e) => Some(Err(e)),
        }
    });
    let inbound = std::pin::pin!(inbound);

    let session = Session::new(registration.id(), peer.to_string(), tx, services);
    let result = session.run(inbound).await;

    let session_id = registration.id();
    drop(registration);
    let _ = closer.send(Outbound::Close).await;
    drop(closer);
    let _ = writer.await;
    info!(session = %session_id, live = registry.len(), "connection closed");

    result.map_err(Into::into)
}
