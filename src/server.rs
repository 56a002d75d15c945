//! The device-server side of a connection: accept loop, greeting, built-in request handlers,
//! and the client/sampler bookkeeping they need.
//!
//! Request handlers are synchronous (`Fn(&Server, &Arc<Connection>, &Message) -> Vec<Vec<u8>>`):
//! a device server is typically driving local hardware state rather than awaiting another
//! network round trip, so dispatch stays inline in the connection's reader task and replies are
//! emitted in the order requests were received -- a stronger guarantee than interleaved
//! concurrent dispatch would give, at the cost of one slow handler blocking that connection's
//! other requests. An application with a genuinely slow handler should hand off to its own
//! worker and reply from there by holding the request id itself.

use std::{
    any::Any,
    collections::{HashMap, HashSet},
    net::SocketAddr,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex},
};

use tokio::{net::TcpListener, net::TcpStream, sync::Notify};
use tracing::{error, info, warn};

use crate::{
    connection::{Connection, ConnectionEvent},
    messages::{
        core::{GenericReply, ProtocolFlags, VersionConnect, VersionConnectInform, VersionList},
        log::{Level, Log},
        multi_client::{ClientConnected, ClientList},
        sensors::{SamplingRequest, SamplingStrategy, SensorList, SensorReading, SensorStatus, SensorUpdates},
    },
    prelude::*,
    protocol::MessageKind,
    sampler::Sampler,
    sensor::{AnySensor, SensorSet},
};

/// A registered request's reply-building logic. Returns the reply message's arguments; [`Server`]
/// wraps them with the right message kind, name, and id.
pub type RequestHandler =
    Arc<dyn Fn(&Server, &Arc<Connection>, &Message) -> Vec<Vec<u8>> + Send + Sync>;

struct RegisteredHandler {
    help: String,
    handler: RequestHandler,
}

/// A katcp device server: owns a [`SensorSet`], a registry of request handlers, the set of
/// connected clients, and each client's per-sensor [`Sampler`]s.
pub struct Server {
    name: String,
    sensors: SensorSet,
    clients: Mutex<HashMap<SocketAddr, Arc<Connection>>>,
    samplers: Mutex<HashMap<(SocketAddr, String), Sampler>>,
    handlers: Mutex<HashMap<String, RegisteredHandler>>,
    shutdown: Notify,
}

impl Server {
    pub fn new(name: impl Into<String>, sensors: SensorSet) -> Arc<Self> {
        let server = Arc::new(Self {
            name: name.into(),
            sensors,
            clients: Mutex::new(HashMap::new()),
            samplers: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            shutdown: Notify::new(),
        });
        server.register(
            "watchdog",
            "?watchdog => check that the device is alive",
            Arc::new(handle_watchdog),
        );
        server.register(
            "help",
            "?help [name] => describe the requests this device supports",
            Arc::new(handle_help),
        );
        server.register(
            "sensor-list",
            "?sensor-list [name] => list the available sensors, optionally filtered by name or /regex/",
            Arc::new(handle_sensor_list),
        );
        server.register(
            "sensor-value",
            "?sensor-value [name] => report the current reading of one sensor, or all sensors",
            Arc::new(handle_sensor_value),
        );
        server.register(
            "sensor-sampling",
            "?sensor-sampling name [strategy [params]] => query or configure a sensor's sampling strategy",
            Arc::new(handle_sensor_sampling),
        );
        server.register(
            "version-list",
            "?version-list => list the versions of this device's components",
            Arc::new(handle_version_list),
        );
        server.register(
            "client-list",
            "?client-list => list the connected clients",
            Arc::new(handle_client_list),
        );
        server.register(
            "halt",
            "?halt => stop accepting new connections and prepare for shutdown",
            Arc::new(handle_halt),
        );
        server
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sensors(&self) -> &SensorSet {
        &self.sensors
    }

    /// Registers (or replaces) a request handler. Available to application code for device-
    /// specific requests beyond the built-ins installed by [`Server::new`].
    pub fn register(&self, name: impl Into<String>, help: impl Into<String>, handler: RequestHandler) {
        self.handlers
            .lock()
            .unwrap()
            .insert(name.into(), RegisteredHandler { help: help.into(), handler });
    }

    /// Broadcasts `message` to every connected client.
    pub fn broadcast(&self, message: Message) {
        for conn in self.clients.lock().unwrap().values() {
            let _ = conn.send(message.clone());
        }
    }

    fn broadcast_except(&self, except: SocketAddr, message: Message) {
        for (addr, conn) in self.clients.lock().unwrap().iter() {
            if *addr != except {
                let _ = conn.send(message.clone());
            }
        }
    }

    /// Accepts connections on `listener` until [`Server::halt`] fires or `listener` errors.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!(server = %self.name, "halted, no longer accepting connections");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.clone().accept(stream, peer),
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }
    }

    fn accept(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let server = self.clone();
        let connection = Arc::new(Connection::spawn(stream, peer, move |event| {
            server.handle_event(peer, event);
        }));
        self.clients.lock().unwrap().insert(peer, connection.clone());
        self.send_greeting(&connection);
        self.broadcast_except(
            peer,
            ClientConnected::Inform {
                message: format!("Client connected from {peer}"),
            }
            .to_message(None)
            .unwrap(),
        );
        info!(%peer, "client connected");
    }

    fn send_greeting(&self, conn: &Connection) {
        let protocol = VersionConnect::Inform(VersionConnectInform::KatcpProtocol {
            major: 5,
            minor: 0,
            flags: HashSet::from([ProtocolFlags::MultiClient, ProtocolFlags::MessageIds]),
        });
        let _ = conn.send(protocol.to_message(None).unwrap());
        let _ = conn.send(VersionConnect::library().to_message(None).unwrap());
        let peer = conn.peer_addr();
        let device = VersionConnect::Inform(VersionConnectInform::KatcpDevice {
            api_version: "1.0".to_owned(),
            device: KatcpAddress::new(peer.ip(), Some(peer.port())),
            build_state: format!("{}-{}", self.name, env!("CARGO_PKG_VERSION")),
        });
        let _ = conn.send(device.to_message(None).unwrap());
    }

    fn handle_event(&self, peer: SocketAddr, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message(message) => self.dispatch(peer, message),
            ConnectionEvent::Malformed(e) => {
                let log = Log::Inform {
                    level: Level::Error,
                    timestamp: KatcpTimestamp::now(),
                    name: self.name.clone(),
                    message: e.to_string(),
                };
                // `Log` informs go to every client, not just the one whose line was malformed --
                // see messages::multi_client's doc comment on which informs are broadcast.
                self.broadcast(log.to_message(None).unwrap());
            }
            ConnectionEvent::Closed => {
                self.clients.lock().unwrap().remove(&peer);
                self.samplers.lock().unwrap().retain(|(addr, _), _| *addr != peer);
                info!(%peer, "client disconnected");
            }
        }
    }

    fn dispatch(&self, peer: SocketAddr, message: Message) {
        if message.kind() != MessageKind::Request {
            return;
        }
        let Some(conn) = self.clients.lock().unwrap().get(&peer).cloned() else {
            return;
        };
        let handler = self.handlers.lock().unwrap().get(message.name()).map(|r| r.handler.clone());
        let reply_args = match handler {
            Some(handler) => {
                match catch_unwind(AssertUnwindSafe(|| handler(self, &conn, &message))) {
                    Ok(args) => args,
                    Err(payload) => {
                        let message_text = panic_message(payload);
                        error!(name = message.name(), error = %message_text, "request handler panicked");
                        GenericReply::Error {
                            ret_code: RetCode::Fail,
                            message: message_text,
                        }
                        .to_arguments()
                    }
                }
            }
            None => GenericReply::Error {
                ret_code: RetCode::Invalid,
                message: format!("unknown request {}", message.name()),
            }
            .to_arguments(),
        };
        if let Ok(reply) = Message::new(MessageKind::Reply, message.name(), message.id(), reply_args) {
            let _ = conn.send(reply);
        }
    }

    /// Stops accepting new connections. Existing connections are left open; callers that want to
    /// close them should track connected peers themselves (e.g. via the `halt` handler) and drop
    /// their connections explicitly.
    pub fn halt(&self) {
        self.shutdown.notify_waiters();
    }
}

/// Extracts a human-readable message from a caught panic payload, falling back to a generic
/// description when the panic didn't unwind with a `&str` or `String` payload.
fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "request handler panicked".to_owned()
    }
}

fn handle_watchdog(_: &Server, _: &Arc<Connection>, _: &Message) -> Vec<Vec<u8>> {
    GenericReply::Ok.to_arguments()
}

fn handle_halt(server: &Server, _: &Arc<Connection>, _: &Message) -> Vec<Vec<u8>> {
    server.halt();
    GenericReply::Ok.to_arguments()
}

fn handle_help(server: &Server, conn: &Arc<Connection>, message: &Message) -> Vec<Vec<u8>> {
    let filter = message
        .arguments()
        .first()
        .and_then(|a| String::from_argument(a).ok());
    let handlers = server.handlers.lock().unwrap();
    let mut count = 0u32;
    for (name, registered) in handlers.iter() {
        if filter.as_deref().is_some_and(|f| f != name) {
            continue;
        }
        let _ = conn.send(
            crate::messages::core::Help::Inform {
                name: name.clone(),
                description: registered.help.clone(),
            }
            .to_message(message.id())
            .unwrap(),
        );
        count += 1;
    }
    match filter {
        Some(name) if count == 0 => IntReply::Error {
            ret_code: RetCode::Fail,
            message: format!("unknown request {name}"),
        }
        .to_arguments(),
        _ => IntReply::Ok { num: count }.to_arguments(),
    }
}

/// Matches `filter` (an exact sensor name, a `/regex/`, or `None` for all sensors) against
/// `server`'s sensor set, shared by `?sensor-list` and `?sensor-value`.
fn matching_sensors(server: &Server, filter: &Option<String>) -> Vec<Arc<dyn AnySensor>> {
    let all = server.sensors.snapshot();
    match filter {
        None => all,
        Some(pattern) => match pattern.strip_prefix('/').and_then(|p| p.strip_suffix('/')) {
            Some(pattern) => match regex::Regex::new(pattern) {
                Ok(re) => all.into_iter().filter(|s| re.is_match(s.name())).collect(),
                Err(_) => Vec::new(),
            },
            None => all.into_iter().filter(|s| s.name() == pattern).collect(),
        },
    }
}

fn handle_sensor_list(server: &Server, conn: &Arc<Connection>, message: &Message) -> Vec<Vec<u8>> {
    let filter = message
        .arguments()
        .first()
        .and_then(|a| String::from_argument(a).ok());
    let matched = matching_sensors(server, &filter);
    for sensor in &matched {
        let _ = conn.send(SensorList::Inform(sensor.list_inform()).to_message(message.id()).unwrap());
    }
    if filter.is_some() && matched.is_empty() {
        IntReply::Error {
            ret_code: RetCode::Fail,
            message: "no sensor matched".to_owned(),
        }
        .to_arguments()
    } else {
        IntReply::Ok { num: matched.len() as u32 }.to_arguments()
    }
}

fn handle_sensor_value(server: &Server, conn: &Arc<Connection>, message: &Message) -> Vec<Vec<u8>> {
    let filter = message
        .arguments()
        .first()
        .and_then(|a| String::from_argument(a).ok());
    let matched = matching_sensors(server, &filter);
    for sensor in &matched {
        let reading = sensor.current_reading();
        let inform = crate::messages::sensors::SensorValue::Inform(SensorUpdates {
            timestamp: reading.timestamp,
            readings: vec![SensorReading {
                name: sensor.name().to_owned(),
                status: reading.status,
                value: reading.value,
            }],
        });
        let _ = conn.send(inform.to_message(message.id()).unwrap());
    }
    if filter.is_some() && matched.is_empty() {
        IntReply::Error {
            ret_code: RetCode::Fail,
            message: "no sensor matched".to_owned(),
        }
        .to_arguments()
    } else {
        IntReply::Ok { num: matched.len() as u32 }.to_arguments()
    }
}

fn handle_sensor_sampling(server: &Server, conn: &Arc<Connection>, message: &Message) -> Vec<Vec<u8>> {
    let mut args = message.arguments().iter().cloned();
    let request = match SamplingRequest::from_arguments(&mut args) {
        Ok(r) => r,
        Err(e) => {
            return GenericReply::Error {
                ret_code: RetCode::Invalid,
                message: e.to_string(),
            }
            .to_arguments()
        }
    };
    let Some(sensor) = server.sensors.get(&request.names) else {
        return GenericReply::Error {
            ret_code: RetCode::Fail,
            message: format!("unknown sensor {}", request.names),
        }
        .to_arguments();
    };
    let peer = conn.peer_addr();
    let key = (peer, request.names.clone());
    let strategy = match request.strategy {
        Some(strategy) => {
            let conn_for_emit = conn.clone();
            let sensor_name = request.names.clone();
            let sampler = Sampler::install(sensor, strategy, move |reading| {
                let inform = SensorStatus::Inform(SensorUpdates {
                    timestamp: reading.timestamp,
                    readings: vec![SensorReading {
                        name: sensor_name.clone(),
                        status: reading.status,
                        value: reading.value.clone(),
                    }],
                });
                let _ = conn_for_emit.send(inform.to_message(None).unwrap());
            });
            server.samplers.lock().unwrap().insert(key, sampler);
            strategy
        }
        None => server
            .samplers
            .lock()
            .unwrap()
            .get(&key)
            .map(|s| *s.strategy())
            .unwrap_or(SamplingStrategy::None),
    };
    crate::messages::sensors::SamplingReply {
        names: request.names,
        strategy,
    }
    .to_arguments()
}

fn handle_version_list(_: &Server, conn: &Arc<Connection>, message: &Message) -> Vec<Vec<u8>> {
    let inform = VersionList::Inform {
        name: "katcp-library".to_owned(),
        version: format!("katcp-{}", env!("CARGO_PKG_VERSION")),
        uuid: String::new(),
    };
    let _ = conn.send(inform.to_message(message.id()).unwrap());
    IntReply::Ok { num: 1 }.to_arguments()
}

fn handle_client_list(server: &Server, conn: &Arc<Connection>, message: &Message) -> Vec<Vec<u8>> {
    let peers: Vec<SocketAddr> = server.clients.lock().unwrap().keys().copied().collect();
    for peer in &peers {
        let _ = conn.send(
            ClientList::Inform {
                addr: KatcpAddress::new(peer.ip(), Some(peer.port())),
            }
            .to_message(message.id())
            .unwrap(),
        );
    }
    IntReply::Ok { num: peers.len() as u32 }.to_arguments()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{messages::sensors::Status, sensor::Sensor};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::time::{timeout, Duration};

    async fn connect(server: Arc<Server>) -> (TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.serve(listener));
        let stream = TcpStream::connect(addr).await.unwrap();
        let peer = stream.local_addr().unwrap();
        (stream, peer)
    }

    async fn read_line(reader: &mut BufReader<&mut TcpStream>) -> String {
        let mut line = String::new();
        timeout(Duration::from_secs(1), reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        line.trim_end().to_owned()
    }

    #[tokio::test]
    async fn greeting_and_watchdog_roundtrip() {
        let server = Server::new("test-device", SensorSet::new());
        let (mut stream, _peer) = connect(server).await;
        let mut reader = BufReader::new(&mut stream);
        assert!(read_line(&mut reader).await.starts_with("#version-connect katcp-protocol"));
        assert!(read_line(&mut reader).await.starts_with("#version-connect katcp-library"));
        assert!(read_line(&mut reader).await.starts_with("#version-connect katcp-device"));

        stream.write_all(b"?watchdog[7]\n").await.unwrap();
        let mut reader = BufReader::new(&mut stream);
        let reply = read_line(&mut reader).await;
        assert_eq!(reply, "!watchdog[7] ok");
    }

    #[tokio::test]
    async fn sensor_list_reports_registered_sensors() {
        let sensors = SensorSet::new();
        sensors.add(Arc::new(Sensor::new("x.temp", "temperature", "C", Status::Nominal, 20.0f64)));
        let server = Server::new("test-device", sensors);
        let (mut stream, _peer) = connect(server).await;
        let mut reader = BufReader::new(&mut stream);
        // skip the three greeting informs
        for _ in 0..3 {
            read_line(&mut reader).await;
        }
        stream.write_all(b"?sensor-list\n").await.unwrap();
        let mut reader = BufReader::new(&mut stream);
        let inform = read_line(&mut reader).await;
        assert!(inform.starts_with("#sensor-list x.temp"));
        let reply = read_line(&mut reader).await;
        assert_eq!(reply, "!sensor-list ok 1");
    }

    #[tokio::test]
    async fn sensor_value_reports_the_current_reading() {
        let sensors = SensorSet::new();
        sensors.add(Arc::new(Sensor::new("x.temp", "temperature", "C", Status::Nominal, 20.0f64)));
        let server = Server::new("test-device", sensors);
        let (mut stream, _peer) = connect(server).await;
        let mut reader = BufReader::new(&mut stream);
        for _ in 0..3 {
            read_line(&mut reader).await;
        }
        stream.write_all(b"?sensor-value[3] x.temp\n").await.unwrap();
        let mut reader = BufReader::new(&mut stream);
        let inform = read_line(&mut reader).await;
        assert!(inform.starts_with("#sensor-value[3]"));
        assert!(inform.ends_with("x.temp nominal 20"));
        let reply = read_line(&mut reader).await;
        assert_eq!(reply, "!sensor-value[3] ok 1");
    }

    #[tokio::test]
    async fn unknown_request_is_rejected() {
        let server = Server::new("test-device", SensorSet::new());
        let (mut stream, _peer) = connect(server).await;
        let mut reader = BufReader::new(&mut stream);
        for _ in 0..3 {
            read_line(&mut reader).await;
        }
        stream.write_all(b"?frobnicate\n").await.unwrap();
        let mut reader = BufReader::new(&mut stream);
        let reply = read_line(&mut reader).await;
        assert!(reply.starts_with("!frobnicate invalid"));
    }

    #[tokio::test]
    async fn a_panicking_handler_fails_its_request_without_closing_the_connection() {
        let server = Server::new("test-device", SensorSet::new());
        server.register(
            "explode",
            "?explode => always panics, for testing handler isolation",
            Arc::new(|_: &Server, _: &Arc<Connection>, _: &Message| {
                panic!("boom");
            }),
        );
        let (mut stream, _peer) = connect(server).await;
        let mut reader = BufReader::new(&mut stream);
        for _ in 0..3 {
            read_line(&mut reader).await;
        }
        stream.write_all(b"?explode\n").await.unwrap();
        let reply = read_line(&mut reader).await;
        assert!(reply.starts_with("!explode fail"));

        // the connection survives the panic: a later request still gets a reply.
        stream.write_all(b"?watchdog\n").await.unwrap();
        let reply = read_line(&mut reader).await;
        assert_eq!(reply, "!watchdog ok");
    }
}
