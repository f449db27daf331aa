//! Client-side SOCKS4 and SOCKS5 handshakes over an already-connected
//! byte stream.
//!
//! Every protocol failure — a non-zero status byte as much as a short or
//! malformed reply — shuts down **both** halves of the underlying stream
//! before the error surfaces, so no half-open connection outlives a
//! failed negotiation.

use std::net::SocketAddrV4;

use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    errors::Error as CrateError,
    io::{Buffer, RawReader, RawWriter},
    net::{ProxyCredentials, TargetAddr},
};


const SOCKS5_VERSION: u8 = 0x05;
const SOCKS4_VERSION: u8 = 0x04;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERNAME_PASSWORD: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const AUTH_SUBNEGOTIATION_VERSION: u8 = 0x01;
const AUTH_SUCCESS: u8 = 0x00;

const SOCKS4_REQUEST_GRANTED: u8 = 90;
const SOCKS4_REQUEST_REJECTED: u8 = 91;
const SOCKS4_IDENTD_UNREACHABLE: u8 = 92;
const SOCKS4_IDENTD_MISMATCH: u8 = 93;


/// Failures signalled by a SOCKS proxy or detected in its replies.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SocksError {
    #[error("unsupported SOCKS version in reply: {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("general SOCKS server failure")]
    GeneralFailure,

    #[error("connection not allowed by ruleset")]
    NotAllowed,

    #[error("network unreachable")]
    NetworkUnreachable,

    #[error("host unreachable")]
    HostUnreachable,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("TTL expired")]
    TtlExpired,

    #[error("command not supported")]
    CommandNotSupported,

    #[error("address type not supported")]
    AddressTypeNotSupported,

    #[error("unknown status code in reply: {0}")]
    UnknownStatus(u8),

    #[error("reply badly formatted")]
    MalformedReply,

    #[error("request rejected or failed")]
    Socks4Rejected,

    #[error("request rejected: identd not reachable")]
    Socks4IdentdUnreachable,

    #[error("request rejected: identd credential mismatch")]
    Socks4IdentdMismatch,

    #[error("SOCKS4 supports IPv4 target addresses only")]
    Socks4RequiresIpv4,

    #[error("{field} does not fit in 255 bytes")]
    FieldTooLong { field: &'static str },

    #[error("{field} contains characters outside Latin-1")]
    FieldNotLatin1 { field: &'static str },
}


/// A connected stream the handshake can talk both directions over.
pub trait ProxyStream: RawReader + RawWriter {}

impl<S: RawReader + RawWriter> ProxyStream for S {}


/// Encode `value` as Latin-1: every char must be a code point at or
/// below U+00FF, and the result must fit a single length-prefix byte.
pub(crate) fn encode_latin1(field: &'static str, value: &str) -> Result<Vec<u8>, SocksError> {
    let mut bytes = Vec::with_capacity(value.len());
    for ch in value.chars() {
        let code = ch as u32;
        if code > 0xFF {
            return Err(SocksError::FieldNotLatin1 { field });
        }
        bytes.push(code as u8);
    }

    if bytes.len() > 255 {
        return Err(SocksError::FieldTooLong { field });
    }

    Ok(bytes)
}


fn send<S: ProxyStream>(stream: &mut S, bytes: &[u8]) -> Result<(), CrateError> {
    let mut buffer = Buffer::new();
    buffer.write_slice(bytes);
    stream.write_from(&mut buffer, bytes.len() as u64)?;
    stream.flush()
}

/// Read exactly `byte_count` bytes. A short read or end of stream in the
/// middle of a handshake maps to a single "reply badly formatted" error.
fn read_exact<S: ProxyStream>(stream: &mut S, byte_count: usize) -> Result<Vec<u8>, CrateError> {
    let mut scratch = Buffer::new();

    while (scratch.size() as usize) < byte_count {
        let wanted = (byte_count - scratch.size() as usize) as u64;
        let read = stream.read_at_most_to(&mut scratch, wanted)?;
        if read == 0 {
            return Err(SocksError::MalformedReply.into());
        }
    }

    Ok(scratch.read_to_vec(byte_count))
}

fn close_both_halves<S: ProxyStream>(stream: &mut S) {
    if let Err(error) = RawReader::close(stream) {
        debug!(%error, "failed to close the read half after a SOCKS failure");
    }
    if let Err(error) = RawWriter::close(stream) {
        debug!(%error, "failed to close the write half after a SOCKS failure");
    }
}


/// Run the SOCKS5 client handshake: greeting, optional username/password
/// sub-negotiation, CONNECT request, reply. On success the stream has
/// transitioned to relaying data for `target`.
pub fn socks5_handshake<S: ProxyStream>(
    stream: &mut S,
    target: &TargetAddr,
    credentials: Option<&ProxyCredentials>,
) -> Result<(), CrateError> {
    match run_socks5(stream, target, credentials) {
        Ok(()) => Ok(()),
        Err(error) => {
            close_both_halves(stream);
            Err(error)
        }
    }
}

fn run_socks5<S: ProxyStream>(
    stream: &mut S,
    target: &TargetAddr,
    credentials: Option<&ProxyCredentials>,
) -> Result<(), CrateError> {
    send(
        stream,
        &[
            SOCKS5_VERSION,
            2,
            METHOD_NO_AUTH,
            METHOD_USERNAME_PASSWORD,
        ],
    )?;

    let greeting_reply = read_exact(stream, 2)?;
    if greeting_reply[0] != SOCKS5_VERSION {
        return Err(SocksError::UnsupportedVersion(greeting_reply[0]).into());
    }

    match greeting_reply[1] {
        METHOD_NO_AUTH => trace!("proxy selected no authentication"),
        METHOD_USERNAME_PASSWORD => {
            trace!("proxy selected username/password authentication");
            authenticate(stream, credentials)?;
        }
        METHOD_NO_ACCEPTABLE => return Err(SocksError::NoAcceptableMethod.into()),
        _ => return Err(SocksError::MalformedReply.into()),
    }

    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    encode_target(&mut request, target)?;
    send(stream, &request)?;

    let reply = read_exact(stream, 4)?;
    if reply[0] != SOCKS5_VERSION {
        return Err(SocksError::UnsupportedVersion(reply[0]).into());
    }
    if reply[1] != 0 {
        return Err(map_socks5_status(reply[1]).into());
    }

    // Consume the bound address and port the proxy reports.
    let bound_address_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => read_exact(stream, 1)?[0] as usize,
        _ => return Err(SocksError::MalformedReply.into()),
    };
    read_exact(stream, bound_address_len + 2)?;

    trace!(%target, "SOCKS5 handshake complete");
    Ok(())
}

/// RFC 1929 username/password sub-negotiation. With no credentials
/// configured, an empty username and password are offered.
fn authenticate<S: ProxyStream>(
    stream: &mut S,
    credentials: Option<&ProxyCredentials>,
) -> Result<(), CrateError> {
    let (username, password) = match credentials {
        Some(credentials) => (
            encode_latin1("username", credentials.username())?,
            credentials.password_bytes(),
        ),
        None => (Vec::new(), Vec::new()),
    };

    let mut message = Vec::with_capacity(3 + username.len() + password.len());
    message.push(AUTH_SUBNEGOTIATION_VERSION);
    message.push(username.len() as u8);
    message.extend_from_slice(&username);
    message.push(password.len() as u8);
    message.extend_from_slice(&password);

    send(stream, &message)?;

    let reply = read_exact(stream, 2)?;
    match reply[1] {
        AUTH_SUCCESS => Ok(()),
        _ => Err(SocksError::AuthenticationFailed.into()),
    }
}

fn encode_target(request: &mut Vec<u8>, target: &TargetAddr) -> Result<(), CrateError> {
    match target {
        TargetAddr::Ipv4(address) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&address.ip().octets());
        }
        TargetAddr::Ipv6(address) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&address.ip().octets());
        }
        TargetAddr::Domain { host, .. } => {
            let host_bytes = encode_latin1("domain", host)?;
            request.push(ATYP_DOMAIN);
            request.push(host_bytes.len() as u8);
            request.extend_from_slice(&host_bytes);
        }
    }
    request.extend_from_slice(&target.port().to_be_bytes());

    Ok(())
}

fn map_socks5_status(status: u8) -> SocksError {
    match status {
        1 => SocksError::GeneralFailure,
        2 => SocksError::NotAllowed,
        3 => SocksError::NetworkUnreachable,
        4 => SocksError::HostUnreachable,
        5 => SocksError::ConnectionRefused,
        6 => SocksError::TtlExpired,
        7 => SocksError::CommandNotSupported,
        8 => SocksError::AddressTypeNotSupported,
        other => SocksError::UnknownStatus(other),
    }
}


/// Run the SOCKS4 client handshake. SOCKS4 carries IPv4 addresses only:
/// domain targets (the protocol has no address type for them) and IPv6
/// are rejected before a single byte goes out.
pub fn socks4_handshake<S: ProxyStream>(
    stream: &mut S,
    target: &TargetAddr,
    username: &str,
) -> Result<(), CrateError> {
    match run_socks4(stream, target, username) {
        Ok(()) => Ok(()),
        Err(error) => {
            close_both_halves(stream);
            Err(error)
        }
    }
}

fn run_socks4<S: ProxyStream>(
    stream: &mut S,
    target: &TargetAddr,
    username: &str,
) -> Result<(), CrateError> {
    let address: &SocketAddrV4 = match target {
        TargetAddr::Ipv4(address) => address,
        TargetAddr::Ipv6(_) | TargetAddr::Domain { .. } => {
            return Err(SocksError::Socks4RequiresIpv4.into());
        }
    };

    let username_bytes = encode_latin1("username", username)?;

    let mut request = Vec::with_capacity(9 + username_bytes.len());
    request.push(SOCKS4_VERSION);
    request.push(CMD_CONNECT);
    request.extend_from_slice(&address.port().to_be_bytes());
    request.extend_from_slice(&address.ip().octets());
    request.extend_from_slice(&username_bytes);
    request.push(0x00);

    send(stream, &request)?;

    let reply = read_exact(stream, 8)?;
    if reply[0] != 0x00 {
        return Err(SocksError::MalformedReply.into());
    }

    match reply[1] {
        SOCKS4_REQUEST_GRANTED => {
            trace!(%target, "SOCKS4 handshake complete");
            Ok(())
        }
        SOCKS4_REQUEST_REJECTED => Err(SocksError::Socks4Rejected.into()),
        SOCKS4_IDENTD_UNREACHABLE => Err(SocksError::Socks4IdentdUnreachable.into()),
        SOCKS4_IDENTD_MISMATCH => Err(SocksError::Socks4IdentdMismatch.into()),
        other => Err(SocksError::UnknownStatus(other).into()),
    }
}
