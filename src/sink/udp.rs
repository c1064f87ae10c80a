// UDP sink: one datagram per record, fire-and-forget.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex};

use super::{Sink, SinkCore};
use crate::record::Record;

/// Datagrams are capped at the UDP payload limit; longer lines truncate.
const MAX_DATAGRAM_BYTES: usize = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

struct Connection {
    socket: UdpSocket,
    endpoint: SocketAddr,
}

/// Sends each accepted record as a single datagram to a resolved endpoint.
/// The socket opens lazily at the start of `consume` and re-opens the same
/// way after any send failure.
pub struct UdpSink {
    core: SinkCore,
    host: String,
    port: u16,
    ip_version: IpVersion,
    connection: Mutex<Option<Connection>>,
}

impl UdpSink {
    pub(crate) fn new(host: &str, port: u16, ip_version: IpVersion) -> Arc<Self> {
        Arc::new(Self {
            core: SinkCore::new(),
            host: host.to_string(),
            port,
            ip_version,
            connection: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> (&str, u16) {
        (&self.host, self.port)
    }

    /// Resolve and open if nothing is open yet. Failures are reported and
    /// leave the connection closed; the next `consume` retries.
    fn check_connection(&self, connection: &mut Option<Connection>) {
        if connection.is_some() {
            return;
        }
        eprintln!("opening connection to {}:{}", self.host, self.port);

        let resolved = match (self.host.as_str(), self.port).to_socket_addrs() {
            Ok(addrs) => {
                let want_v6 = self.ip_version == IpVersion::V6;
                addrs.into_iter().find(|addr| addr.is_ipv6() == want_v6)
            }
            Err(err) => {
                eprintln!("failed to resolve {}:{}: {}", self.host, self.port, err);
                return;
            }
        };
        let Some(endpoint) = resolved else {
            eprintln!(
                "no {} address for {}:{}",
                match self.ip_version {
                    IpVersion::V4 => "IPv4",
                    IpVersion::V6 => "IPv6",
                },
                self.host,
                self.port
            );
            return;
        };

        let bind_addr = match self.ip_version {
            IpVersion::V4 => "0.0.0.0:0",
            IpVersion::V6 => "[::]:0",
        };
        match UdpSocket::bind(bind_addr) {
            Ok(socket) => *connection = Some(Connection { socket, endpoint }),
            Err(err) => eprintln!(
                "failed to open socket for {}:{}: {}",
                self.host, self.port, err
            ),
        }
    }
}

/// Truncate a formatted line to the datagram cap. Byte-level: the receiver
/// sees raw bytes, so a split UTF-8 sequence at the cut is acceptable.
fn capped(bytes: &[u8]) -> &[u8] {
    &bytes[..bytes.len().min(MAX_DATAGRAM_BYTES)]
}

impl Sink for UdpSink {
    fn consume(&self, batch: &[Record]) {
        if self.core.quitting() {
            return;
        }

        let mut connection = self.connection.lock().unwrap();
        self.check_connection(&mut connection);

        let format = self.core.lock_format();
        let mut filters = self.core.lock_filters();

        let mut buffer = String::new();
        for record in batch {
            if self.core.quitting() {
                break;
            }
            let Some(open) = connection.as_ref() else { break };
            if !filters.meets_criteria(record) {
                continue;
            }

            buffer.clear();
            format.append_line(record, &mut buffer);

            if let Err(err) = open.socket.send_to(capped(buffer.as_bytes()), open.endpoint) {
                eprintln!("error sending datagram to {}: {}", open.endpoint, err);
                *connection = None;
            }
        }
    }

    fn core(&self) -> &SinkCore {
        &self.core
    }
}
