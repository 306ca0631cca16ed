//! WebSocket front end for [`RelayHub`].
//!
//! Each accepted connection joins the room named by its request path and
//! runs one task that owns both halves of the socket.

use crate::hub::RelayHub;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Accept relay clients on `listener` until it fails.
pub async fn serve(listener: TcpListener, hub: Arc<RelayHub>) -> io::Result<()> {
    info!("Relay listening on {}", listener.local_addr()?);
    loop {
        let (stream, addr) = listener.accept().await?;
        tokio::spawn(handle_connection(stream, addr, hub.clone()));
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, hub: Arc<RelayHub>) {
    let path = Arc::new(Mutex::new(String::new()));
    let captured = path.clone();
    let callback = move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        *captured.lock() = req.uri().path().to_string();
        Ok(response)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let room = RelayHub::room_for_path(&path.lock());
    let (outbox, mut inbox) = mpsc::unbounded_channel();
    let id = hub.enter(&room, outbox);
    debug!("Client {} from {} joined room '{}'", id, addr, room);

    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            frame = inbox.recv() => match frame {
                Some(text) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        warn!("Write to client {} failed: {}", id, e);
                        break;
                    }
                }
                None => break,
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => hub.route(&room, &id, &text),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => hub.route(&room, &id, &text),
                    Err(_) => warn!("Dropping non-utf8 binary frame from client {}", id),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Read from client {} failed: {}", id, e);
                    break;
                }
            }
        }
    }

    hub.leave(&room, &id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_session::{LinkEvent, LinkSink, RelayConnector, WsConnector};
    use mesh_wire::InboundEnvelope;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ws_clients_share_room() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hub = Arc::new(RelayHub::new());
        tokio::spawn(serve(listener, hub.clone()));

        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        let sink: LinkSink = Arc::new(move |event| recorded.lock().push(event));
        let endpoint = format!("ws://{}/chat", addr);
        let first = WsConnector::new().connect(&endpoint, sink);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = WsConnector::new().connect(&endpoint, Arc::new(|_| {}));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hub.members("chat"), 2);
        assert!(second.send(r#"[[1], "[\"hello\"]"]"#.to_string()));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let payloads: Vec<String> = events
            .lock()
            .iter()
            .filter_map(|e| match e {
                LinkEvent::Message(text) => InboundEnvelope::decode(text).ok(),
                _ => None,
            })
            .map(|e| e.payload)
            .collect();
        assert_eq!(payloads, vec![r#"["connect"]"#, r#"["enter",2]"#, r#"["hello"]"#]);

        first.close();
        second.close();
    }
}
