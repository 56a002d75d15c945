//! The controller side of a connection: sends requests with a message id, matches replies and
//! their accompanying informs back to the right caller by that id, and hands everything else
//! (asynchronous informs, logs) to a caller-supplied callback.
//!
//! Built on the same [`Connection`] a [`crate::server::Server`] uses, just with the event handler
//! driving request/reply correlation instead of dispatching to handlers.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use tokio::{net::TcpStream, sync::oneshot};
use tracing::warn;

use crate::{
    connection::{Connection, ConnectionEvent},
    error::{KatcpError, KatcpResult},
    protocol::{Message, MessageKind, MAX_MESSAGE_ID},
};

/// True if `message`'s first argument is the bare `ok` return code -- the common shape of a
/// [`crate::messages::core::GenericReply::Ok`] or [`crate::messages::core::IntReply::Ok`] reply.
pub fn reply_ok(message: &Message) -> bool {
    message.arguments().first().map(Vec::as_slice) == Some(b"ok".as_slice())
}

struct PendingRequest {
    name: String,
    informs: Vec<Message>,
    reply_tx: oneshot::Sender<KatcpResult<(Message, Vec<Message>)>>,
}

type InformHandler = Box<dyn FnMut(Message) + Send>;

struct Shared {
    pending: Mutex<HashMap<u64, PendingRequest>>,
    next_mid: Mutex<u64>,
    on_inform: Mutex<Option<InformHandler>>,
}

impl Shared {
    /// The next message id not already in use by an outstanding request, wrapping before
    /// `MAX_MESSAGE_ID` back to 1.
    fn allocate_mid(&self) -> u64 {
        let mut next = self.next_mid.lock().unwrap();
        let pending = self.pending.lock().unwrap();
        loop {
            let id = *next;
            *next = if id >= MAX_MESSAGE_ID { 1 } else { id + 1 };
            if !pending.contains_key(&id) {
                return id;
            }
        }
    }

    fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message(message) => self.handle_message(message),
            ConnectionEvent::Malformed(e) => {
                warn!(error = %e, "malformed katcp line from server");
            }
            ConnectionEvent::Closed => self.fail_all_outstanding(),
        }
    }

    fn handle_message(&self, message: Message) {
        match message.kind() {
            MessageKind::Reply => self.complete_request(message),
            MessageKind::Inform => self.route_inform(message),
            MessageKind::Request => {
                warn!(name = message.name(), "server sent a request, ignoring");
            }
        }
    }

    /// Matches `message` to the pending request it replies to: by id when the reply carries one,
    /// falling back to the (at most one, per the no-message-id protocol rule) pending request of
    /// the same name otherwise.
    fn pending_id_for(pending: &HashMap<u64, PendingRequest>, message: &Message) -> Option<u64> {
        message.id().or_else(|| {
            pending
                .iter()
                .find(|(_, p)| p.name == message.name())
                .map(|(id, _)| *id)
        })
    }

    fn complete_request(&self, message: Message) {
        let mut pending = self.pending.lock().unwrap();
        let Some(id) = Self::pending_id_for(&pending, &message) else {
            warn!(name = message.name(), "reply to no outstanding request");
            return;
        };
        if let Some(entry) = pending.remove(&id) {
            let _ = entry.reply_tx.send(Ok((message, entry.informs)));
        }
    }

    fn route_inform(&self, message: Message) {
        let mut pending = self.pending.lock().unwrap();
        let id = Self::pending_id_for(&pending, &message);
        match id.and_then(|id| pending.get_mut(&id)) {
            Some(entry) => entry.informs.push(message),
            None => {
                drop(pending);
                if let Some(handler) = self.on_inform.lock().unwrap().as_mut() {
                    handler(message);
                }
            }
        }
    }

    fn fail_all_outstanding(&self) {
        let pending: Vec<_> = self.pending.lock().unwrap().drain().collect();
        for (_, entry) in pending {
            let _ = entry.reply_tx.send(Err(KatcpError::ConnectionLost));
        }
    }
}

/// A katcp client connection: sends requests and awaits their replies, with any informs sent
/// synchronously as part of a reply's processing buffered alongside it rather than handed to the
/// unsolicited-inform callback.
pub struct Client {
    connection: Connection,
    shared: Arc<Shared>,
}

impl Client {
    /// Connects to `addr`, discarding any informs not tied to a request (including the server's
    /// greeting). Use [`Client::connect_with_inform_handler`] to observe them.
    pub async fn connect(addr: SocketAddr) -> KatcpResult<Self> {
        Self::connect_with_inform_handler(addr, |_| {}).await
    }

    /// Connects to `addr`, calling `on_inform` for every inform that doesn't belong to an
    /// outstanding request -- the server's `#version-connect` greeting, `#client-connected`,
    /// unsampled `#sensor-status` pushes, and the like.
    pub async fn connect_with_inform_handler(
        addr: SocketAddr,
        on_inform: impl FnMut(Message) + Send + 'static,
    ) -> KatcpResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        let peer = stream.peer_addr()?;
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            next_mid: Mutex::new(1),
            on_inform: Mutex::new(Some(Box::new(on_inform))),
        });
        let shared_for_events = shared.clone();
        let connection = Connection::spawn(stream, peer, move |event| {
            shared_for_events.handle_event(event);
        });
        Ok(Self { connection, shared })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.connection.peer_addr()
    }

    /// Sends a `?name arg...` request and awaits its reply, buffering any informs sent as part of
    /// answering it. Carries no timeout of its own -- wrap the call in `tokio::time::timeout` if
    /// the caller wants one; a lost connection resolves the call with
    /// [`KatcpError::ConnectionLost`] regardless.
    pub async fn request(
        &self,
        name: &str,
        arguments: Vec<Vec<u8>>,
    ) -> KatcpResult<(Message, Vec<Message>)> {
        let mid = self.shared.allocate_mid();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(
            mid,
            PendingRequest {
                name: name.to_owned(),
                informs: Vec::new(),
                reply_tx,
            },
        );
        let message = Message::new(MessageKind::Request, name, Some(mid), arguments)?;
        if self.connection.send(message).is_err() {
            self.shared.pending.lock().unwrap().remove(&mid);
            return Err(KatcpError::ConnectionLost);
        }
        reply_rx.await.map_err(|_| KatcpError::ConnectionLost)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::core::{GenericReply, Watchdog};
    use crate::prelude::*;
    use std::sync::{Arc, Mutex};
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
        time::{timeout, Duration},
    };

    #[tokio::test]
    async fn request_round_trips_through_a_bare_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(&mut stream);
            let mut line = String::new();
            timeout(Duration::from_secs(1), reader.read_line(&mut line))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(line.trim_end(), "?watchdog[1]");
            stream.write_all(b"!watchdog[1] ok\n").await.unwrap();
        });

        let client = Client::connect(addr).await.unwrap();
        let (reply, informs) = client.request("watchdog", vec![]).await.unwrap();
        assert_eq!(reply.name(), "watchdog");
        assert!(informs.is_empty());
        assert!(reply_ok(&reply));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn informs_sent_before_the_reply_are_buffered_with_it() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(&mut stream);
            let mut line = String::new();
            timeout(Duration::from_secs(1), reader.read_line(&mut line))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(line.trim_end(), "?help[1]");
            stream
                .write_all(b"#help[1] watchdog check\\_that\\_the\\_device\\_is\\_alive\n")
                .await
                .unwrap();
            stream.write_all(b"!help[1] ok 1\n").await.unwrap();
        });

        let client = Client::connect(addr).await.unwrap();
        let (reply, informs) = client.request("help", vec![]).await.unwrap();
        assert!(reply_ok(&reply));
        assert_eq!(informs.len(), 1);
        assert_eq!(informs[0].name(), "help");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn unsolicited_informs_go_to_the_callback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(b"#version-connect katcp-protocol 5.0-MI\n")
                .await
                .unwrap();
            stream
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _client = Client::connect_with_inform_handler(addr, move |message| {
            seen_clone.lock().unwrap().push(message.name().to_owned());
        })
        .await
        .unwrap();
        let _stream = server_task.await.unwrap();

        timeout(Duration::from_secs(1), async {
            while seen.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["version-connect".to_owned()]);
    }

    #[tokio::test]
    async fn disconnection_fails_outstanding_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let client = Client::connect(addr).await.unwrap();
        server_task.await.unwrap();
        let result = client.request("watchdog", vec![]).await;
        assert!(matches!(result, Err(KatcpError::ConnectionLost)));
    }

    #[test]
    fn reply_ok_checks_the_first_argument() {
        let ok = Watchdog::Reply(GenericReply::Ok).to_message(None).unwrap();
        assert!(reply_ok(&ok));
        let err = Watchdog::Reply(GenericReply::Error {
            ret_code: RetCode::Fail,
            message: "nope".to_owned(),
        })
        .to_message(None)
        .unwrap();
        assert!(!reply_ok(&err));
    }
}
