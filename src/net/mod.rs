//! Blocking TCP endpoints wired to the watchdog-driven timeout machinery.

use std::{
    io,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use cancellation_scope::scope;
use tracing::{debug, warn};

use crate::{
    clock,
    errors::Error,
    io::{Buffer, Duplex, RawReader, RawWriter, TimedReader, TimedWriter},
    socks,
    timeout::AsyncTimeout,
};

mod options;
mod proxy;

pub use options::{EndpointOptions, ProtocolFamily};
pub use proxy::{Proxy, ProxyCredentials, TargetAddr};


/// Resolve a target into concrete socket addresses, filtered by family.
fn resolve(target: &TargetAddr, family: ProtocolFamily) -> Result<Vec<SocketAddr>, Error> {
    let candidates: Vec<SocketAddr> = match target {
        TargetAddr::Ipv4(address) => vec![SocketAddr::V4(*address)],
        TargetAddr::Ipv6(address) => vec![SocketAddr::V6(*address)],
        TargetAddr::Domain { host, port } => (host.as_str(), *port)
            .to_socket_addrs()
            .map_err(|_| Error::UnknownHost { host: host.clone() })?
            .collect(),
    };

    let admitted: Vec<SocketAddr> = candidates
        .into_iter()
        .filter(|address| family.admits(address))
        .collect();

    if admitted.is_empty() {
        return Err(Error::UnknownHost {
            host: target.to_string(),
        });
    }

    Ok(admitted)
}

/// The time left for connecting: the earlier of the configured connect
/// timeout and the current scope's budget. `None` means unlimited; an
/// already-spent budget fails immediately.
fn remaining_connect_budget(connect_timeout: Duration) -> Result<Option<Duration>, Error> {
    let now = clock::now_nanos();

    match scope::effective_fire_time(now, connect_timeout) {
        None => Ok(None),
        Some(fire_at) => {
            let remaining = clock::nanos_until(fire_at, now);
            if remaining <= 0 {
                return Err(Error::Timeout { source: None });
            }
            Ok(Some(clock::duration_from_nanos(remaining)))
        }
    }
}

fn connect_any(addresses: &[SocketAddr], options: &EndpointOptions) -> Result<TcpStream, Error> {
    let mut last_error: Option<io::Error> = None;

    for address in addresses {
        let attempt = match remaining_connect_budget(options.connect_timeout)? {
            Some(limit) => TcpStream::connect_timeout(address, limit),
            None => TcpStream::connect(address),
        };

        match attempt {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                debug!(%address, %error, "connect attempt failed");
                last_error = Some(error);
            }
        }
    }

    match last_error {
        Some(error) if error.kind() == io::ErrorKind::TimedOut => {
            Err(Error::ConnectFailed(error).into_timeout())
        }
        Some(error) => Err(Error::ConnectFailed(error)),
        None => Err(Error::ConnectFailed(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no candidate addresses",
        ))),
    }
}

fn apply_socket_options(stream: &TcpStream, socket_options: &[(String, String)]) {
    for (name, value) in socket_options {
        let applied = match name.as_str() {
            "TCP_NODELAY" => match value.parse::<bool>() {
                Ok(nodelay) => stream.set_nodelay(nodelay),
                Err(_) => {
                    warn!(name, value, "unparsable socket option value");
                    continue;
                }
            },
            "IP_TTL" => match value.parse::<u32>() {
                Ok(ttl) => stream.set_ttl(ttl),
                Err(_) => {
                    warn!(name, value, "unparsable socket option value");
                    continue;
                }
            },
            _ => {
                warn!(name, "unrecognised socket option, skipping");
                continue;
            }
        };

        if let Err(error) = applied {
            warn!(name, %error, "failed to apply socket option");
        }
    }
}


/// The reading half of a connected TCP stream.
pub struct TcpReader {
    stream: TcpStream,
}

impl RawReader for TcpReader {
    fn read_at_most_to(&mut self, sink: &mut Buffer, byte_count: u64) -> Result<u64, Error> {
        if byte_count == 0 {
            return Ok(0);
        }

        let read = sink
            .write_from_reader(&mut self.stream, byte_count)
            .map_err(Error::Socket)?;
        Ok(read as u64)
    }

    fn close(&mut self) -> Result<(), Error> {
        self.stream.shutdown(Shutdown::Read).map_err(Error::Socket)
    }
}

/// The writing half of a connected TCP stream.
pub struct TcpWriter {
    stream: TcpStream,
}

impl RawWriter for TcpWriter {
    fn write_from(&mut self, source: &mut Buffer, byte_count: u64) -> Result<(), Error> {
        if byte_count > source.size() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write byte count exceeds the buffered bytes",
            )));
        }

        let mut remaining = byte_count;
        while remaining > 0 {
            let Some(head) = source.head_slice() else {
                break;
            };

            let run = (head.len() as u64).min(remaining) as usize;
            io::Write::write_all(&mut self.stream, &head[..run]).map_err(Error::Socket)?;
            source.skip(run as u64);
            remaining -= run as u64;
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        io::Write::flush(&mut self.stream).map_err(Error::Socket)
    }

    fn close(&mut self) -> Result<(), Error> {
        self.stream.shutdown(Shutdown::Write).map_err(Error::Socket)
    }
}


/// A connected TCP stream plus the deadline slot that can shut it down.
///
/// Readers and writers obtained from one endpoint share its
/// [`AsyncTimeout`]; when a deadline expires, the expiry callback shuts
/// the socket down both ways, forcibly unblocking whichever thread is
/// stuck in an OS call on it.
pub struct TcpEndpoint {
    stream: TcpStream,
    timeout: Arc<AsyncTimeout>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl std::fmt::Debug for TcpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpEndpoint")
            .field("stream", &self.stream)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

impl TcpEndpoint {
    /// Connect to `target`, honouring the configured connect timeout and
    /// the current cancellation scope.
    pub fn connect(target: &TargetAddr, options: &EndpointOptions) -> Result<Self, Error> {
        let addresses = resolve(target, options.protocol_family)?;
        let stream = connect_any(&addresses, options)?;
        apply_socket_options(&stream, &options.socket_options);

        debug!(%target, "connected");
        Self::from_stream(stream, options)
    }

    /// Connect to `target` through a SOCKS proxy: connect to the proxy,
    /// run the matching handshake, and hand back the relaying endpoint.
    pub fn connect_via_proxy(
        proxy: &Proxy,
        target: &TargetAddr,
        options: &EndpointOptions,
    ) -> Result<Self, Error> {
        let endpoint = Self::connect(proxy.address(), options)?;

        let mut handshake_stream = Duplex::new(endpoint.reader()?, endpoint.writer()?);
        match proxy {
            Proxy::Socks4 { username, .. } => {
                socks::socks4_handshake(&mut handshake_stream, target, username)?;
            }
            Proxy::Socks5 { credentials, .. } => {
                socks::socks5_handshake(&mut handshake_stream, target, credentials.as_ref())?;
            }
        }

        debug!(%target, proxy = %proxy.address(), "proxy handshake complete");
        Ok(endpoint)
    }

    fn from_stream(stream: TcpStream, options: &EndpointOptions) -> Result<Self, Error> {
        let expiry_handle = stream.try_clone().map_err(Error::Socket)?;
        let timeout = Arc::new(AsyncTimeout::new(move || {
            expiry_handle.shutdown(Shutdown::Both)
        }));

        Ok(Self {
            stream,
            timeout,
            read_timeout: options.read_timeout,
            write_timeout: options.write_timeout,
        })
    }

    /// A timed reader over this endpoint's stream.
    pub fn reader(&self) -> Result<TimedReader<TcpReader>, Error> {
        let stream = self.stream.try_clone().map_err(Error::Socket)?;
        Ok(self
            .timeout
            .wrap_reader(TcpReader { stream }, self.read_timeout))
    }

    /// A timed writer over this endpoint's stream.
    pub fn writer(&self) -> Result<TimedWriter<TcpWriter>, Error> {
        let stream = self.stream.try_clone().map_err(Error::Socket)?;
        Ok(self
            .timeout
            .wrap_writer(TcpWriter { stream }, self.write_timeout))
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, Error> {
        self.stream.peer_addr().map_err(Error::Socket)
    }

    /// Shut the stream down both ways.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.stream.shutdown(Shutdown::Both).map_err(Error::Socket)
    }
}


/// A listening TCP socket producing [`TcpEndpoint`]s.
pub struct TcpServer {
    listener: TcpListener,
    options: EndpointOptions,
}

impl TcpServer {
    /// Bind a listener. The requested `max_pending_connections` is
    /// recorded for diagnostics; the std listener itself uses the
    /// platform's default backlog.
    pub fn bind(address: impl ToSocketAddrs, options: &EndpointOptions) -> Result<Self, Error> {
        let listener = TcpListener::bind(address).map_err(Error::Socket)?;
        debug!(
            backlog = options.max_pending_connections,
            address = %listener.local_addr().map_err(Error::Socket)?,
            "listening"
        );

        Ok(Self {
            listener,
            options: options.clone(),
        })
    }

    /// Accept one connection as a timed endpoint.
    pub fn accept(&self) -> Result<TcpEndpoint, Error> {
        let (stream, peer) = self.listener.accept().map_err(Error::Socket)?;
        debug!(%peer, "accepted");

        apply_socket_options(&stream, &self.options.socket_options);
        TcpEndpoint::from_stream(stream, &self.options)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener.local_addr().map_err(Error::Socket)
    }
}


#[cfg(test)]
mod test {
    use std::{
        net::{Ipv4Addr, SocketAddrV4, TcpListener},
        sync::mpsc,
        thread,
        time::Instant,
    };

    use assert_matches::assert_matches;
    use cancellation_scope::Cancellable;

    use super::*;

    fn local_target(listener: &TcpListener) -> TargetAddr {
        TargetAddr::from(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::LOCALHOST,
            listener.local_addr().unwrap().port(),
        )))
    }

    #[test]
    fn read_times_out_against_a_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let options = EndpointOptions {
            read_timeout: Duration::from_millis(50),
            ..EndpointOptions::default()
        };
        let endpoint = TcpEndpoint::connect(&local_target(&listener), &options).unwrap();
        let mut reader = endpoint.reader().unwrap();

        let started = Instant::now();
        let mut sink = Buffer::new();
        let result = reader.read_at_most_to(&mut sink, 1);
        let elapsed = started.elapsed();

        assert_matches!(result, Err(Error::Timeout { .. }));
        assert!(elapsed >= Duration::from_millis(40), "returned too early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "returned too late: {elapsed:?}");

        // The expiry callback shut the socket down; further reads fail
        // fast instead of blocking.
        let followup_started = Instant::now();
        let _ = reader.read_at_most_to(&mut sink, 1);
        assert!(followup_started.elapsed() < Duration::from_millis(40));
    }

    #[test]
    fn echoed_data_round_trips_through_the_timed_adapters() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = local_target(&listener);
        let server = thread::spawn(move || {
            let (mut stream, _peer) = listener.accept().unwrap();
            let mut payload = [0u8; 4];
            io::Read::read_exact(&mut stream, &mut payload).unwrap();
            io::Write::write_all(&mut stream, &payload).unwrap();
        });

        let options = EndpointOptions {
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            ..EndpointOptions::default()
        };
        let endpoint = TcpEndpoint::connect(&target, &options).unwrap();

        let mut writer = endpoint.writer().unwrap();
        let mut outgoing = Buffer::new();
        outgoing.write_slice(b"ping");
        writer.write_from(&mut outgoing, 4).unwrap();
        writer.flush().unwrap();

        let mut reader = endpoint.reader().unwrap();
        let mut incoming = Buffer::new();
        while incoming.size() < 4 {
            let remaining = 4 - incoming.size();
            let read = reader.read_at_most_to(&mut incoming, remaining).unwrap();
            assert!(read > 0, "peer closed early");
        }
        assert_eq!(incoming.read_to_vec(4), b"ping");

        server.join().unwrap();
    }

    #[test]
    fn manual_cancel_is_observed_when_the_deadline_fires() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = local_target(&listener);

        let (token_sender, token_receiver) = mpsc::channel();
        let worker = thread::spawn(move || {
            Cancellable::run_forever(|token| {
                // A deadline, not a per-operation timeout: the timed
                // reader swaps its own (unlimited) default over the
                // latter, while the deadline always applies.
                token.set_deadline_nanos(clock::now_nanos() + 300_000_000);
                token_sender.send(token.clone()).unwrap();

                let endpoint = TcpEndpoint::connect(&target, &EndpointOptions::default()).unwrap();
                let mut reader = endpoint.reader().unwrap();

                let started = Instant::now();
                let mut sink = Buffer::new();
                let result = reader.read_at_most_to(&mut sink, 1);

                (result, started.elapsed(), token.clone())
            })
        });

        let token = token_receiver.recv().unwrap();
        // Let the worker reach the blocking read before cancelling.
        thread::sleep(Duration::from_millis(100));
        token.cancel();

        let (result, elapsed, token) = worker.join().unwrap();

        // cancel() alone does not interrupt the blocked read; the scope's
        // deadline does, and the failure surfaces as a timeout on a
        // cancelled token.
        assert_matches!(result, Err(Error::Timeout { .. }) | Err(Error::Cancelled(_)));
        assert!(token.is_cancelled());
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn connect_to_a_dead_port_fails_with_connect_failed() {
        // Bind then drop to find a port with no listener behind it.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = local_target(&listener);
        drop(listener);

        let result = TcpEndpoint::connect(&target, &EndpointOptions::default());
        assert_matches!(result, Err(Error::ConnectFailed(_)));
    }

    #[test]
    fn family_filter_can_rule_out_every_candidate() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = local_target(&listener);

        let options = EndpointOptions {
            protocol_family: ProtocolFamily::Ipv6,
            ..EndpointOptions::default()
        };
        let result = TcpEndpoint::connect(&target, &options);
        assert_matches!(result, Err(Error::UnknownHost { .. }));
    }

    #[test]
    fn server_accepts_timed_endpoints() {
        let server = TcpServer::bind("127.0.0.1:0", &EndpointOptions::default()).unwrap();
        let address = server.local_addr().unwrap();

        let client = thread::spawn(move || {
            let target = TargetAddr::from(address);
            let endpoint = TcpEndpoint::connect(&target, &EndpointOptions::default()).unwrap();

            let mut writer = endpoint.writer().unwrap();
            let mut outgoing = Buffer::new();
            outgoing.write_slice(b"hi");
            writer.write_from(&mut outgoing, 2).unwrap();
            writer.flush().unwrap();
        });

        let accepted = server.accept().unwrap();
        let mut reader = accepted.reader().unwrap();

        let mut incoming = Buffer::new();
        while incoming.size() < 2 {
            let remaining = 2 - incoming.size();
            let read = reader.read_at_most_to(&mut incoming, remaining).unwrap();
            assert!(read > 0, "peer closed early");
        }
        assert_eq!(incoming.read_to_vec(2), b"hi");

        client.join().unwrap();
    }
}
