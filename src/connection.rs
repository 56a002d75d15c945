//! Line-framing over a byte stream: accumulates inbound bytes, splits them into katcp lines,
//! and parses each one, while a single outbound queue keeps replies, informs, and log lines in
//! the order they were queued.
//!
//! Modeled on a worker that owns one half of a socket and forwards what it reads onto a channel,
//! generalized here to drive both halves of the connection and to decode katcp messages instead
//! of a bespoke wire format.

use std::net::SocketAddr;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{error::KatcpError, protocol::Message};

/// Something a [`Connection`]'s reader loop observed.
pub enum ConnectionEvent {
    /// A complete, well-formed message.
    Message(Message),
    /// A line that didn't parse. The connection stays open; callers typically answer with a
    /// `#log` inform rather than dropping the client over one bad line.
    Malformed(KatcpError),
    /// The peer closed the connection, or a read/write failed.
    Closed,
}

/// One client or server connection: a reader task decoding inbound lines and a writer task
/// draining a single outbound queue, so concurrent informs and replies never interleave
/// mid-message.
pub struct Connection {
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Message>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Connection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Queues `message` for delivery. Ordering against every other call to `send` on this
    /// connection is preserved; this never blocks on the network.
    pub fn send(&self, message: Message) -> Result<(), KatcpError> {
        self.outbound
            .send(message)
            .map_err(|_| KatcpError::ConnectionLost)
    }

    /// Splits `stream`, spawning a reader task (delivering [`ConnectionEvent`]s to `on_event`)
    /// and a writer task (draining the returned connection's send queue).
    pub fn spawn(
        stream: TcpStream,
        peer: SocketAddr,
        mut on_event: impl FnMut(ConnectionEvent) + Send + 'static,
    ) -> Self {
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match Message::parse(line.as_bytes()) {
                        Ok(message) => on_event(ConnectionEvent::Message(message)),
                        Err(e) => {
                            warn!(%peer, error = %e, "malformed katcp line");
                            on_event(ConnectionEvent::Malformed(e));
                        }
                    },
                    Ok(None) => {
                        debug!(%peer, "connection closed by peer");
                        on_event(ConnectionEvent::Closed);
                        return;
                    }
                    Err(e) => {
                        warn!(%peer, error = %e, "read error");
                        on_event(ConnectionEvent::Closed);
                        return;
                    }
                }
            }
        });

        let writer_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if write_half.write_all(&message.to_bytes()).await.is_err() {
                    return;
                }
            }
        });

        Self {
            peer,
            outbound: tx,
            reader_task,
            writer_task,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;
    use std::sync::{Arc, Mutex};
    use tokio::{net::TcpListener, time::{timeout, Duration}};

    async fn accept_one(listener: &TcpListener) -> (TcpStream, SocketAddr) {
        listener.accept().await.unwrap()
    }

    #[tokio::test]
    async fn parses_complete_lines_into_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server_stream, peer) = accept_one(&listener).await;
        let mut client_stream = client.await.unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let _conn = Connection::spawn(server_stream, peer, move |event| {
            events_clone.lock().unwrap().push(match event {
                ConnectionEvent::Message(m) => format!("message:{}", m.name()),
                ConnectionEvent::Malformed(_) => "malformed".to_owned(),
                ConnectionEvent::Closed => "closed".to_owned(),
            });
        });

        client_stream.write_all(b"?watchdog[1]\n").await.unwrap();
        timeout(Duration::from_secs(1), async {
            while events.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*events.lock().unwrap(), vec!["message:watchdog".to_owned()]);
    }

    #[tokio::test]
    async fn malformed_line_does_not_close_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server_stream, peer) = accept_one(&listener).await;
        let mut client_stream = client.await.unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let _conn = Connection::spawn(server_stream, peer, move |event| {
            events_clone.lock().unwrap().push(match event {
                ConnectionEvent::Message(m) => format!("message:{}", m.name()),
                ConnectionEvent::Malformed(_) => "malformed".to_owned(),
                ConnectionEvent::Closed => "closed".to_owned(),
            });
        });

        client_stream.write_all(b"not a katcp line\n").await.unwrap();
        client_stream.write_all(b"?watchdog\n").await.unwrap();
        timeout(Duration::from_secs(1), async {
            while events.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            vec!["malformed".to_owned(), "message:watchdog".to_owned()]
        );
    }

    #[tokio::test]
    async fn send_writes_bytes_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server_stream, peer) = accept_one(&listener).await;
        let mut client_stream = client.await.unwrap();

        let conn = Connection::spawn(server_stream, peer, |_| {});
        conn.send(Message::new(MessageKind::Reply, "watchdog", Some(1), vec![b"ok".to_vec()]).unwrap())
            .unwrap();
        conn.send(Message::new(MessageKind::Inform, "log", None, vec![b"info".to_vec()]).unwrap())
            .unwrap();

        let mut reader = BufReader::new(&mut client_stream);
        let mut first = String::new();
        let mut second = String::new();
        timeout(Duration::from_secs(1), reader.read_line(&mut first)).await.unwrap().unwrap();
        timeout(Duration::from_secs(1), reader.read_line(&mut second)).await.unwrap().unwrap();
        assert_eq!(first.trim_end(), "!watchdog[1] ok");
        assert_eq!(second.trim_end(), "#log info");
    }
}
