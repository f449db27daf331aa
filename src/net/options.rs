use std::time::Duration;


/// Which address family name resolution may yield.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolFamily {
    Any,
    Ipv4,
    Ipv6,
}

impl ProtocolFamily {
    pub(crate) fn admits(&self, address: &std::net::SocketAddr) -> bool {
        match self {
            Self::Any => true,
            Self::Ipv4 => address.is_ipv4(),
            Self::Ipv6 => address.is_ipv6(),
        }
    }
}


/// Per-endpoint configuration.
///
/// All timeouts default to [`Duration::ZERO`], meaning unlimited. Read
/// and write timeouts are enforced by the shared watchdog, not by the OS:
/// the socket itself carries no `SO_RCVTIMEO`/`SO_SNDTIMEO`.
#[derive(Clone, Debug)]
pub struct EndpointOptions {
    /// Deadline for the initial connect.
    pub connect_timeout: Duration,

    /// Default deadline for each read call.
    pub read_timeout: Duration,

    /// Default deadline for each written chunk.
    pub write_timeout: Duration,

    /// Requested listen backlog for server endpoints.
    pub max_pending_connections: u32,

    /// Address family filter applied during name resolution.
    pub protocol_family: ProtocolFamily,

    /// Opaque `(name, value)` pairs forwarded to the OS socket.
    /// Recognised names: `TCP_NODELAY` (boolean), `IP_TTL` (integer).
    /// Unrecognised names are logged and skipped.
    pub socket_options: Vec<(String, String)>,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::ZERO,
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            max_pending_connections: 50,
            protocol_family: ProtocolFamily::Any,
            socket_options: Vec::new(),
        }
    }
}
