use std::{
    fmt::{self, Display},
    net::{SocketAddr, SocketAddrV4, SocketAddrV6},
};

use crate::{errors::Error, secure::SecureString, socks};


/// The remote a connection should be made to: a literal address, or a
/// host name the proxy (or local resolver) is asked to resolve.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(SocketAddrV4),
    Ipv6(SocketAddrV6),
    Domain { host: String, port: u16 },
}

impl TargetAddr {
    /// Parse a `host:port` string. Literal IPv4 and bracketed IPv6
    /// addresses become their respective variants; anything else is kept
    /// as a domain for later resolution.
    ///
    /// A port that is not a number maps to [`Error::UnknownService`]:
    /// service names are not resolved here.
    pub fn parse(input: &str) -> Result<Self, Error> {
        if let Ok(address) = input.parse::<SocketAddr>() {
            return Ok(address.into());
        }

        let Some((host, service)) = input.rsplit_once(':') else {
            return Err(Error::UnknownService {
                service: input.to_owned(),
            });
        };

        let port: u16 = service.parse().map_err(|_| Error::UnknownService {
            service: service.to_owned(),
        })?;

        if host.is_empty() {
            return Err(Error::UnknownHost {
                host: input.to_owned(),
            });
        }

        Ok(Self::Domain {
            host: host.to_owned(),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Ipv4(address) => address.port(),
            Self::Ipv6(address) => address.port(),
            Self::Domain { port, .. } => *port,
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(address: SocketAddr) -> Self {
        match address {
            SocketAddr::V4(v4) => Self::Ipv4(v4),
            SocketAddr::V6(v6) => Self::Ipv6(v6),
        }
    }
}

impl Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4(address) => write!(f, "{address}"),
            Self::Ipv6(address) => write!(f, "{address}"),
            Self::Domain { host, port } => write!(f, "{host}:{port}"),
        }
    }
}


/// Username and password for SOCKS5 username/password sub-negotiation.
/// Both fields must fit in 255 Latin-1 bytes; the password is kept
/// encrypted in memory until the handshake needs it.
#[derive(Debug)]
pub struct ProxyCredentials {
    username: String,
    password: SecureString,
}

impl ProxyCredentials {
    pub fn new(username: &str, password: &str) -> Result<Self, Error> {
        socks::encode_latin1("username", username)?;
        let password_bytes = socks::encode_latin1("password", password)?;

        Ok(Self {
            username: username.to_owned(),
            password: SecureString::new(&password_bytes),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Decrypt the password into fresh Latin-1 bytes for the wire.
    pub(crate) fn password_bytes(&self) -> Vec<u8> {
        self.password.decrypt()
    }
}


/// A SOCKS proxy in front of the actual target.
#[derive(Debug)]
pub enum Proxy {
    Socks4 {
        address: TargetAddr,
        username: String,
    },
    Socks5 {
        address: TargetAddr,
        credentials: Option<ProxyCredentials>,
    },
}

impl Proxy {
    pub fn socks4(address: TargetAddr, username: &str) -> Result<Self, Error> {
        socks::encode_latin1("username", username)?;

        Ok(Self::Socks4 {
            address,
            username: username.to_owned(),
        })
    }

    pub fn socks5(address: TargetAddr) -> Self {
        Self::Socks5 {
            address,
            credentials: None,
        }
    }

    pub fn socks5_with_credentials(
        address: TargetAddr,
        username: &str,
        password: &str,
    ) -> Result<Self, Error> {
        Ok(Self::Socks5 {
            address,
            credentials: Some(ProxyCredentials::new(username, password)?),
        })
    }

    pub fn address(&self) -> &TargetAddr {
        match self {
            Self::Socks4 { address, .. } => address,
            Self::Socks5 { address, .. } => address,
        }
    }
}


#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_recognises_literal_ipv4() {
        let target = TargetAddr::parse("127.0.0.1:80").unwrap();
        assert_matches!(target, TargetAddr::Ipv4(address) if address.port() == 80);
    }

    #[test]
    fn parse_recognises_bracketed_ipv6() {
        let target = TargetAddr::parse("[::1]:443").unwrap();
        assert_matches!(target, TargetAddr::Ipv6(address) if address.port() == 443);
    }

    #[test]
    fn parse_keeps_host_names_for_later_resolution() {
        let target = TargetAddr::parse("example.com:8080").unwrap();
        assert_matches!(
            target,
            TargetAddr::Domain { host, port: 8080 } if host == "example.com"
        );
    }

    #[test]
    fn non_numeric_ports_are_unknown_services() {
        assert_matches!(
            TargetAddr::parse("example.com:http"),
            Err(Error::UnknownService { service }) if service == "http"
        );
        assert_matches!(
            TargetAddr::parse("example.com"),
            Err(Error::UnknownService { .. })
        );
    }

    #[test]
    fn empty_hosts_are_rejected() {
        assert_matches!(TargetAddr::parse(":80"), Err(Error::UnknownHost { .. }));
    }

    #[test]
    fn credentials_reject_values_outside_latin_1() {
        assert_matches!(
            ProxyCredentials::new("πυθαγόρας", "secret"),
            Err(Error::Socks(_))
        );
        assert_matches!(
            ProxyCredentials::new("alice", &"x".repeat(256)),
            Err(Error::Socks(_))
        );
    }

    #[test]
    fn credentials_keep_the_password_recoverable() {
        let credentials = ProxyCredentials::new("alice", "sésame").unwrap();
        assert_eq!(credentials.username(), "alice");
        // 0xE9 is the Latin-1 encoding of 'é'.
        assert_eq!(credentials.password_bytes(), vec![b's', 0xE9, b's', b'a', b'm', b'e']);
    }
}
