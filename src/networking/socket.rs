use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

use crate::progress::ProgressEvent;

///
/// Forwards progress events to one websocket client as JSON text frames
/// until either side goes away. Messages from the client are ignored.
///
pub async fn forward_progress(ws: WebSocket, events: broadcast::Receiver<ProgressEvent>) {
    let connection_id = Uuid::new_v4();
    debug!("progress listener {} connected", connection_id);
    let (mut client_ws_sender, mut client_ws_rcv) = ws.split();
    let mut events = BroadcastStream::new(events);

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(event)) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!("cannot encode progress event: {}", err);
                            continue;
                        }
                    };
                    if let Err(err) = client_ws_sender.send(Message::text(text)).await {
                        debug!("progress listener {} went away: {}", connection_id, err);
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    debug!("progress listener {} lagging, skipped {} events", connection_id, skipped);
                }
                None => break,
            },
            incoming = client_ws_rcv.next() => match incoming {
                Some(Ok(message)) if message.is_close() => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!("progress listener {} errored: {}", connection_id, err);
                    break;
                }
                None => break,
            },
        }
    }
    debug!("progress listener {} disconnected", connection_id);
}
