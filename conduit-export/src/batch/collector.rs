//! Collector endpoints and transports.

use std::fmt;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;

/// Connect timeout for stream collectors.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors from collector transports.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown transport {0:?} (expected TCP or UDP)")]
    UnknownTransport(String),

    #[error("failed to resolve {address}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("{0} resolved to no addresses")]
    NoAddress(String),

    #[error("failed to open socket for {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to send to {endpoint}: {source}")]
    Send {
        endpoint: String,
        #[source]
        source: io::Error,
    },
}

/// Collector transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Stream transport (TCP).
    Tcp,
    /// Datagram transport (UDP).
    Udp,
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(TransportKind::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(TransportKind::Udp)
        } else {
            Err(TransportError::UnknownTransport(s.to_string()))
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "TCP"),
            TransportKind::Udp => write!(f, "UDP"),
        }
    }
}

/// A resolved collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorEndpoint {
    pub address: String,
    pub port: u16,
    pub kind: TransportKind,
    pub socket_addr: SocketAddr,
}

impl CollectorEndpoint {
    /// Resolve `address:port`, taking the first address returned.
    pub fn resolve(address: &str, port: u16, kind: TransportKind) -> Result<Self, TransportError> {
        let socket_addr = (address, port)
            .to_socket_addrs()
            .map_err(|source| TransportError::Resolve {
                address: address.to_string(),
                source,
            })?
            .next()
            .ok_or_else(|| TransportError::NoAddress(address.to_string()))?;

        Ok(Self {
            address: address.to_string(),
            port,
            kind,
            socket_addr,
        })
    }
}

impl fmt::Display for CollectorEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.kind, self.address, self.port)
    }
}

/// One collector connection.
pub trait CollectorTransport: Send {
    fn endpoint(&self) -> &CollectorEndpoint;

    /// Send one complete message.
    fn send(&mut self, message: &[u8]) -> Result<(), TransportError>;
}

/// Datagram collector; one message per datagram.
#[derive(Debug)]
pub struct UdpTransport {
    endpoint: CollectorEndpoint,
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn open(endpoint: CollectorEndpoint) -> Result<Self, TransportError> {
        let local: SocketAddr = if endpoint.socket_addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local).map_err(|source| TransportError::Bind {
            endpoint: endpoint.to_string(),
            source,
        })?;
        Ok(Self { endpoint, socket })
    }
}

impl CollectorTransport for UdpTransport {
    fn endpoint(&self) -> &CollectorEndpoint {
        &self.endpoint
    }

    fn send(&mut self, message: &[u8]) -> Result<(), TransportError> {
        self.socket
            .send_to(message, self.endpoint.socket_addr)
            .map(|_| ())
            .map_err(|source| TransportError::Send {
                endpoint: self.endpoint.to_string(),
                source,
            })
    }
}

/// Stream collector. Messages are framed by their own length field.
///
/// Connects on first send; after a failure the connection is dropped and
/// re-established on the next send.
#[derive(Debug)]
pub struct TcpTransport {
    endpoint: CollectorEndpoint,
    stream: Option<TcpStream>,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(endpoint: CollectorEndpoint) -> Self {
        Self {
            endpoint,
            stream: None,
            connect_timeout: TCP_CONNECT_TIMEOUT,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn connection(&mut self) -> Result<&mut TcpStream, TransportError> {
        if self.stream.is_none() {
            let stream = TcpStream::connect_timeout(&self.endpoint.socket_addr, self.connect_timeout)
                .map_err(|source| TransportError::Connect {
                    endpoint: self.endpoint.to_string(),
                    source,
                })?;
            let _ = stream.set_nodelay(true);
            let _ = stream.set_write_timeout(Some(self.connect_timeout));
            self.stream = Some(stream);
        }
        self.stream.as_mut().ok_or_else(|| TransportError::Connect {
            endpoint: self.endpoint.to_string(),
            source: io::Error::from(io::ErrorKind::NotConnected),
        })
    }
}

impl CollectorTransport for TcpTransport {
    fn endpoint(&self) -> &CollectorEndpoint {
        &self.endpoint
    }

    fn send(&mut self, message: &[u8]) -> Result<(), TransportError> {
        let result = self.connection()?.write_all(message);
        result.map_err(|source| {
            self.stream = None;
            TransportError::Send {
                endpoint: self.endpoint.to_string(),
                source,
            }
        })
    }
}

/// Builds transports for endpoints.
pub trait TransportConnector: Send + Sync {
    fn connect(&self, endpoint: CollectorEndpoint) -> Result<Box<dyn CollectorTransport>, TransportError>;
}

/// Connector producing real sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetConnector;

impl TransportConnector for NetConnector {
    fn connect(&self, endpoint: CollectorEndpoint) -> Result<Box<dyn CollectorTransport>, TransportError> {
        match endpoint.kind {
            TransportKind::Udp => Ok(Box::new(UdpTransport::open(endpoint)?)),
            TransportKind::Tcp => Ok(Box::new(TcpTransport::new(endpoint))),
        }
    }
}

/// A message captured by `MockConnector`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub endpoint: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct MockState {
    sent: Vec<SentMessage>,
    failing_ports: Vec<u16>,
}

/// Connector whose transports record every message instead of sending it.
///
/// Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every send to `port` fail.
    pub fn fail_port(&self, port: u16) {
        self.lock().failing_ports.push(port);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.lock().sent.clone()
    }

    pub fn sent_to(&self, endpoint: &str) -> Vec<Vec<u8>> {
        self.lock()
            .sent
            .iter()
            .filter(|m| m.endpoint == endpoint)
            .map(|m| m.bytes.clone())
            .collect()
    }

    pub fn message_count(&self) -> usize {
        self.lock().sent.len()
    }
}

impl TransportConnector for MockConnector {
    fn connect(&self, endpoint: CollectorEndpoint) -> Result<Box<dyn CollectorTransport>, TransportError> {
        Ok(Box::new(MockTransport {
            endpoint,
            connector: self.clone(),
        }))
    }
}

struct MockTransport {
    endpoint: CollectorEndpoint,
    connector: MockConnector,
}

impl CollectorTransport for MockTransport {
    fn endpoint(&self) -> &CollectorEndpoint {
        &self.endpoint
    }

    fn send(&mut self, message: &[u8]) -> Result<(), TransportError> {
        let mut state = self.connector.lock();
        if state.failing_ports.contains(&self.endpoint.port) {
            return Err(TransportError::Send {
                endpoint: self.endpoint.to_string(),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            });
        }
        state.sent.push(SentMessage {
            endpoint: self.endpoint.to_string(),
            bytes: message.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    fn local(port: u16, kind: TransportKind) -> CollectorEndpoint {
        CollectorEndpoint::resolve("127.0.0.1", port, kind).expect("resolve")
    }

    // ===========================================
    // TransportKind Tests
    // ===========================================

    #[test]
    fn test_transport_kind_case_insensitive() {
        assert_eq!("TCP".parse::<TransportKind>().unwrap(), TransportKind::Tcp);
        assert_eq!("tcp".parse::<TransportKind>().unwrap(), TransportKind::Tcp);
        assert_eq!("Udp".parse::<TransportKind>().unwrap(), TransportKind::Udp);
    }

    #[test]
    fn test_transport_kind_unknown() {
        let err = "SCTP".parse::<TransportKind>().unwrap_err();
        assert!(matches!(err, TransportError::UnknownTransport(ref t) if t == "SCTP"));
        assert!("".parse::<TransportKind>().is_err());
    }

    // ===========================================
    // Endpoint Tests
    // ===========================================

    #[test]
    fn test_endpoint_resolve_and_display() {
        let endpoint = local(4739, TransportKind::Udp);
        assert_eq!(endpoint.socket_addr, "127.0.0.1:4739".parse().unwrap());
        assert_eq!(endpoint.to_string(), "UDP://127.0.0.1:4739");
    }

    // ===========================================
    // Real Transport Tests
    // ===========================================

    #[test]
    fn test_udp_transport_sends_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").expect("bind");
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        let port = receiver.local_addr().expect("addr").port();

        let mut transport = UdpTransport::open(local(port, TransportKind::Udp)).expect("open");
        transport.send(b"message").expect("send");

        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).expect("recv");
        assert_eq!(&buf[..n], b"message");
    }

    #[test]
    fn test_tcp_transport_connects_lazily() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let mut transport = TcpTransport::new(local(port, TransportKind::Tcp));
        assert!(!transport.is_connected());

        transport.send(b"abc").expect("send");
        transport.send(b"def").expect("send");
        assert!(transport.is_connected());

        let (mut conn, _) = listener.accept().expect("accept");
        drop(transport);
        let mut received = Vec::new();
        conn.read_to_end(&mut received).expect("read");
        assert_eq!(received, b"abcdef");
    }

    #[test]
    fn test_tcp_transport_connect_failure_leaves_disconnected() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let mut transport = TcpTransport::new(local(port, TransportKind::Tcp));
        assert!(matches!(
            transport.send(b"x"),
            Err(TransportError::Connect { .. })
        ));
        assert!(!transport.is_connected());
    }

    // ===========================================
    // MockConnector Tests
    // ===========================================

    #[test]
    fn test_mock_connector_records() {
        let connector = MockConnector::new();
        let mut transport = connector.connect(local(1, TransportKind::Udp)).expect("connect");
        transport.send(b"one").expect("send");

        assert_eq!(connector.message_count(), 1);
        assert_eq!(connector.sent_to("UDP://127.0.0.1:1"), vec![b"one".to_vec()]);
    }

    #[test]
    fn test_mock_connector_failing_port() {
        let connector = MockConnector::new();
        connector.fail_port(2);
        let mut transport = connector.connect(local(2, TransportKind::Tcp)).expect("connect");
        assert!(transport.send(b"x").is_err());
        assert_eq!(connector.message_count(), 0);
    }
}
