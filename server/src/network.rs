//! WebSocket front end
//!
//! Each accepted connection gets two tasks: a reader that feeds text frames
//! through the [`Dispatcher`] in arrival order, and a writer that drains the
//! connection's outbound queue. The hub holds the sending end of that queue,
//! so removing a client from the hub is what eventually ends its writer.

use crate::dispatcher::{Dispatcher, Session};
use crate::error::{AuthFailure, ServerError};
use crate::hub::HubHandle;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::packets::ErrorPacket;
use shared::Packet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

pub struct Server {
    listener: TcpListener,
    hub: HubHandle,
    dispatcher: Arc<Dispatcher>,
    next_client_id: AtomicU64,
}

impl Server {
    pub async fn bind(
        addr: &str,
        hub: HubHandle,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening for websocket clients on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            hub,
            dispatcher,
            next_client_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the task is dropped.
    pub async fn run(self) {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };

            let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(handle_connection(
                client_id,
                stream,
                addr,
                self.hub.clone(),
                Arc::clone(&self.dispatcher),
            ));
        }
    }
}

fn encode_frame(payload: Vec<u8>) -> Option<Message> {
    match String::from_utf8(payload) {
        Ok(text) => Some(Message::text(text)),
        Err(e) => {
            error!("Dropping non-utf8 frame: {}", e);
            None
        }
    }
}

async fn handle_connection(
    client_id: u64,
    stream: TcpStream,
    addr: SocketAddr,
    hub: HubHandle,
    dispatcher: Arc<Dispatcher>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let (mut sink, mut source) = ws_stream.split();

    let (outbound, mut queue) = mpsc::unbounded_channel::<Vec<u8>>();
    if !hub.register(client_id, outbound.clone()).await {
        warn!("Refusing client from {}: server full", addr);
        let refusal = Packet::Error(ErrorPacket {
            code: AuthFailure::ServerFull.code(),
        });
        if let Some(frame) = refusal.encode().ok().and_then(encode_frame) {
            let _ = sink.send(frame).await;
        }
        let _ = sink.close().await;
        return;
    }
    info!("Client {} connected from {}", client_id, addr);

    let writer = tokio::spawn(async move {
        while let Some(payload) = queue.recv().await {
            let Some(frame) = encode_frame(payload) else {
                continue;
            };
            if let Err(e) = sink.send(frame).await {
                debug!("Client {} stopped reading: {}", client_id, e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = Session::new(client_id, outbound);
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => {
                dispatcher.dispatch(&mut session, text.as_str().as_bytes()).await;
            }
            Ok(Message::Binary(data)) => dispatcher.dispatch(&mut session, &data).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Client {} read error: {}", client_id, e);
                break;
            }
        }
    }

    hub.unregister(client_id);
    drop(session);
    if let Err(e) = writer.await {
        error!("Writer for client {} panicked: {}", client_id, e);
    }
    info!("Client {} disconnected", client_id);
}
