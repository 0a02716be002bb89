//! Per-connection request handling.
//!
//! Each accepted socket gets one cooperative task running the request loop:
//! read an 80-byte header, dispatch, respond, repeat. A SET drains the
//! rendezvous table for its identifier before its own SET_OK is written, so
//! a client that observes SET_OK knows every earlier GET on that identifier
//! has been answered (or its connection dropped).

use anyhow::Result;
use bytes::Bytes;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::Rc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use crate::protocol::{
    self, ObjectId, RequestHeader, RequestType, ResponseHeader, ResponseType, OBJECT_ID_SIZE,
};

use super::pending::PendingRequest;
use super::ServerState;

/// The writable side of a connection.
///
/// Rendezvous drains write to connections they do not own, so the write half
/// sits behind an async mutex: whoever writes a response holds it for the
/// whole header+payload frame, which keeps a single logical writer per
/// socket. An empty slot means the connection is gone; parked requests that
/// find it empty are skipped.
pub(crate) struct Client {
    peer: SocketAddr,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl Client {
    pub(crate) fn new(peer: SocketAddr, writer: OwnedWriteHalf) -> Rc<Self> {
        Rc::new(Self {
            peer,
            writer: Mutex::new(Some(writer)),
        })
    }

    #[cfg(test)]
    pub(crate) fn detached(peer: SocketAddr) -> Rc<Self> {
        Rc::new(Self {
            peer,
            writer: Mutex::new(None),
        })
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Write one response frame. Returns `false` if the connection is
    /// already gone or the peer went away mid-write; the connection is
    /// dropped in the latter case and the server keeps serving.
    pub(crate) async fn send(&self, header: &ResponseHeader, payload: &[u8]) -> bool {
        let mut slot = self.writer.lock().await;
        let Some(writer) = slot.as_mut() else {
            return false;
        };

        match protocol::write_response(writer, header, payload).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!("dropping client {}: {error:#}", self.peer);
                *slot = None;
                false
            }
        }
    }

    pub(crate) async fn close(&self) {
        *self.writer.lock().await = None;
    }
}

/// Run one connection to completion and release its write half.
pub(crate) async fn serve_client(state: Rc<ServerState>, client: Rc<Client>, mut reader: OwnedReadHalf) {
    tracing::debug!("client connected: {}", client.peer());

    match handle_requests(&state, &client, &mut reader).await {
        Ok(()) => tracing::debug!("client disconnected: {}", client.peer()),
        Err(error) => tracing::warn!("closing client {}: {error:#}", client.peer()),
    }

    client.close().await;
}

async fn handle_requests(
    state: &Rc<ServerState>,
    client: &Rc<Client>,
    reader: &mut OwnedReadHalf,
) -> Result<()> {
    loop {
        let Some(header) = protocol::read_request_header(reader).await? else {
            return Ok(());
        };

        let responded = match header.request_type {
            RequestType::SetObject => handle_set(state, client, reader, header).await?,
            RequestType::GetObject => handle_get(state, client, header).await,
            RequestType::DeleteObject => handle_delete(state, client, header).await,
            RequestType::DuplicateObject => handle_duplicate(state, client, reader, header).await?,
        };

        // A failed write already dropped the connection; stop serving it.
        if !responded {
            return Ok(());
        }
    }
}

async fn handle_set(
    state: &Rc<ServerState>,
    client: &Rc<Client>,
    reader: &mut OwnedReadHalf,
    header: RequestHeader,
) -> Result<bool> {
    anyhow::ensure!(
        header.payload_length <= state.memory_limit,
        "set payload of {} bytes exceeds the {} byte memory limit",
        header.payload_length,
        state.memory_limit
    );
    let length = usize::try_from(header.payload_length)
        .map_err(|_| anyhow::anyhow!("set payload does not fit in memory"))?;

    let payload = protocol::read_payload(reader, length).await?;

    let shared = state
        .register
        .borrow_mut()
        .set(header.object_id, payload);

    // Answer parked readers before acknowledging the write.
    drain_pending(state, header.object_id, &shared).await;

    let response = ResponseHeader {
        object_id: header.object_id,
        payload_length: 0,
        response_id: header.request_id,
        response_type: ResponseType::SetOk,
    };
    Ok(client.send(&response, &[]).await)
}

async fn handle_get(state: &Rc<ServerState>, client: &Rc<Client>, header: RequestHeader) -> bool {
    // The borrow ends with this statement; the response write happens
    // without it.
    let found = state.register.borrow().get(&header.object_id);

    match found {
        Some(payload) => send_get_response(client, &header, &payload).await,
        None => {
            // Not here yet: park until the SET for this identifier arrives.
            state.pending.borrow_mut().park(
                header.object_id,
                PendingRequest {
                    client: Rc::clone(client),
                    header,
                },
            );
            true
        }
    }
}

async fn handle_delete(state: &Rc<ServerState>, client: &Rc<Client>, header: RequestHeader) -> bool {
    let existed = state.register.borrow_mut().delete(&header.object_id);

    let response = ResponseHeader {
        object_id: header.object_id,
        payload_length: 0,
        response_id: header.request_id,
        response_type: if existed {
            ResponseType::DeleteOk
        } else {
            ResponseType::DeleteNotExists
        },
    };
    client.send(&response, &[]).await
}

async fn handle_duplicate(
    state: &Rc<ServerState>,
    client: &Rc<Client>,
    reader: &mut OwnedReadHalf,
    header: RequestHeader,
) -> Result<bool> {
    anyhow::ensure!(
        header.payload_length == OBJECT_ID_SIZE as u64,
        "duplicate request payload must be a {} byte object id, got {}",
        OBJECT_ID_SIZE,
        header.payload_length
    );

    let buf = protocol::read_payload(reader, OBJECT_ID_SIZE).await?;
    let source_id = ObjectId::decode(&buf)?;

    let duplicated = state
        .register
        .borrow_mut()
        .duplicate(&source_id, &header.object_id);

    match duplicated {
        Some(payload) => {
            // Readers may already be waiting on the duplicated name.
            drain_pending(state, header.object_id, &payload).await;
            Ok(send_duplicate_ok(client, &header).await)
        }
        None => {
            // The source does not exist yet: park under it until its SET.
            state.pending.borrow_mut().park(
                source_id,
                PendingRequest {
                    client: Rc::clone(client),
                    header,
                },
            );
            Ok(true)
        }
    }
}

async fn send_get_response(client: &Client, request: &RequestHeader, payload: &Bytes) -> bool {
    // The client-supplied payload_length caps the response body.
    let length = (payload.len() as u64).min(request.payload_length);

    let response = ResponseHeader {
        object_id: request.object_id,
        payload_length: length,
        response_id: request.request_id,
        response_type: ResponseType::GetOk,
    };
    client.send(&response, &payload[..length as usize]).await
}

async fn send_duplicate_ok(client: &Client, request: &RequestHeader) -> bool {
    let response = ResponseHeader {
        object_id: request.object_id,
        payload_length: 0,
        response_id: request.request_id,
        response_type: ResponseType::DuplicateOk,
    };
    client.send(&response, &[]).await
}

/// Drain every request parked on `id`, emitting responses in arrival order.
///
/// The key's queue is removed before any response is written, so a
/// concurrent SET for the same identifier cannot re-process these entries.
/// Closed connections are skipped; nothing is ever re-parked. A parked
/// DUPLICATE registers its destination and then cascades into that
/// destination's own queue, since parked requests may depend on the
/// duplicated name.
pub(crate) fn drain_pending<'a>(
    state: &'a Rc<ServerState>,
    id: ObjectId,
    payload: &'a Bytes,
) -> Pin<Box<dyn Future<Output = ()> + 'a>> {
    Box::pin(async move {
        let Some(waiters) = state.pending.borrow_mut().take(&id) else {
            return;
        };

        for waiter in waiters {
            match waiter.header.request_type {
                RequestType::GetObject => {
                    if !send_get_response(&waiter.client, &waiter.header, payload).await {
                        tracing::warn!(
                            "skipped parked get for object {} (client {} gone)",
                            id,
                            waiter.client.peer()
                        );
                    }
                }
                RequestType::DuplicateObject => {
                    let target = waiter.header.object_id;
                    state.register.borrow_mut().duplicate(&id, &target);

                    if !send_duplicate_ok(&waiter.client, &waiter.header).await {
                        tracing::warn!(
                            "skipped parked duplicate for object {} (client {} gone)",
                            id,
                            waiter.client.peer()
                        );
                    }

                    drain_pending(state, target, payload).await;
                }
                // Only GET and DUPLICATE ever park.
                RequestType::SetObject | RequestType::DeleteObject => {}
            }
        }
    })
}
