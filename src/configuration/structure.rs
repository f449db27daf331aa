use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use miette::{miette, Context, IntoDiagnostic, Result};
use serde::Deserialize;
use tidewatch::{EndpointOptions, Proxy, TargetAddr};
use tracing_subscriber::EnvFilter;

use super::{traits::ResolvableConfiguration, utilities::get_default_configuration_file_path};


#[derive(Clone)]
pub struct Configuration {
    pub logging: LoggingConfiguration,
    pub endpoint: EndpointConfiguration,
    pub proxy: Option<ProxyConfiguration>,
}

#[derive(Deserialize, Clone)]
pub struct UnresolvedConfiguration {
    logging: UnresolvedLoggingConfiguration,
    endpoint: UnresolvedEndpointConfiguration,
    proxy: Option<UnresolvedProxyConfiguration>,
}

impl Configuration {
    pub fn load_from_path<P: AsRef<Path>>(configuration_file_path: P) -> Result<Self> {
        let configuration_file_path = configuration_file_path.as_ref();

        let configuration_file_contents = fs::read_to_string(configuration_file_path)
            .into_diagnostic()
            .wrap_err_with(|| miette!("Failed to read configuration file."))?;

        let unresolved_configuration: UnresolvedConfiguration =
            toml::from_str(&configuration_file_contents)
                .into_diagnostic()
                .wrap_err_with(|| miette!("Failed to parse configuration file as TOML."))?;

        let resolved_configuration = unresolved_configuration
            .resolve()
            .wrap_err_with(|| miette!("Failed to resolve configuration."))?;

        Ok(resolved_configuration)
    }

    pub fn load_from_default_path() -> Result<Self> {
        let default_configuration_file_path = get_default_configuration_file_path()
            .wrap_err_with(|| miette!("Failed to construct default configuration file path."))?;

        Self::load_from_path(default_configuration_file_path)
    }
}

impl ResolvableConfiguration for UnresolvedConfiguration {
    type Resolved = Configuration;

    fn resolve(self) -> Result<Self::Resolved> {
        let logging = self.logging.resolve()?;
        let endpoint = self.endpoint.resolve()?;
        let proxy = match self.proxy {
            Some(proxy) => Some(proxy.resolve()?),
            None => None,
        };

        Ok(Self::Resolved {
            logging,
            endpoint,
            proxy,
        })
    }
}


/*
 * Logging configuration
 */

#[derive(Deserialize, Clone)]
struct UnresolvedLoggingConfiguration {
    console_output_level_filter: String,
    log_file_output_level_filter: String,
    log_file_output_directory: String,
}

#[derive(Clone)]
pub struct LoggingConfiguration {
    pub console_output_level_filter: String,
    pub log_file_output_level_filter: String,
    pub log_file_output_directory: PathBuf,
}

impl ResolvableConfiguration for UnresolvedLoggingConfiguration {
    type Resolved = LoggingConfiguration;

    fn resolve(self) -> Result<Self::Resolved> {
        // Validate the file and console level filters.
        EnvFilter::try_new(&self.console_output_level_filter)
            .into_diagnostic()
            .wrap_err_with(|| miette!("Failed to parse field `console_output_level_filter`"))?;

        EnvFilter::try_new(&self.log_file_output_level_filter)
            .into_diagnostic()
            .wrap_err_with(|| miette!("Failed to parse field `log_file_output_level_filter`"))?;

        let log_file_output_directory = PathBuf::from(self.log_file_output_directory);

        Ok(Self::Resolved {
            console_output_level_filter: self.console_output_level_filter,
            log_file_output_level_filter: self.log_file_output_level_filter,
            log_file_output_directory,
        })
    }
}

impl LoggingConfiguration {
    pub fn console_output_level_filter(&self) -> EnvFilter {
        // SAFETY: This is safe because we checked the input is valid in `resolve`.
        EnvFilter::try_new(&self.console_output_level_filter).unwrap()
    }

    pub fn log_file_output_level_filter(&self) -> EnvFilter {
        // SAFETY: This is safe because we checked the input is valid in `resolve`.
        EnvFilter::try_new(&self.log_file_output_level_filter).unwrap()
    }
}


/*
 * Endpoint configuration
 */

#[derive(Deserialize, Clone)]
struct UnresolvedEndpointConfiguration {
    /// All timeouts are in milliseconds; 0 means unlimited.
    connect_timeout_milliseconds: u64,
    read_timeout_milliseconds: u64,
    write_timeout_milliseconds: u64,
}

#[derive(Clone)]
pub struct EndpointConfiguration {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl ResolvableConfiguration for UnresolvedEndpointConfiguration {
    type Resolved = EndpointConfiguration;

    fn resolve(self) -> Result<Self::Resolved> {
        Ok(Self::Resolved {
            connect_timeout: Duration::from_millis(self.connect_timeout_milliseconds),
            read_timeout: Duration::from_millis(self.read_timeout_milliseconds),
            write_timeout: Duration::from_millis(self.write_timeout_milliseconds),
        })
    }
}

impl EndpointConfiguration {
    pub fn to_endpoint_options(&self) -> EndpointOptions {
        EndpointOptions {
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            ..EndpointOptions::default()
        }
    }
}


/*
 * Proxy configuration
 */

#[derive(Deserialize, Clone)]
struct UnresolvedProxyConfiguration {
    /// Either "socks4" or "socks5".
    kind: String,
    address: String,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Socks4,
    Socks5,
}

#[derive(Clone)]
pub struct ProxyConfiguration {
    pub kind: ProxyKind,
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ResolvableConfiguration for UnresolvedProxyConfiguration {
    type Resolved = ProxyConfiguration;

    fn resolve(self) -> Result<Self::Resolved> {
        let kind = match self.kind.as_str() {
            "socks4" => ProxyKind::Socks4,
            "socks5" => ProxyKind::Socks5,
            other => {
                return Err(miette!(
                    "Unrecognized proxy kind {} (expected socks4 or socks5).",
                    other
                ));
            }
        };

        Ok(Self::Resolved {
            kind,
            address: self.address,
            username: self.username,
            password: self.password,
        })
    }
}

impl ProxyConfiguration {
    /// Assemble the proxy value object, validating the address and the
    /// credential encoding.
    pub fn to_proxy(&self) -> Result<Proxy> {
        let address = TargetAddr::parse(&self.address)
            .into_diagnostic()
            .wrap_err_with(|| miette!("Failed to parse proxy address {}.", self.address))?;

        let proxy = match self.kind {
            ProxyKind::Socks4 => {
                Proxy::socks4(address, self.username.as_deref().unwrap_or_default())
                    .into_diagnostic()
                    .wrap_err_with(|| miette!("Failed to assemble SOCKS4 proxy."))?
            }
            ProxyKind::Socks5 => match (&self.username, &self.password) {
                (Some(username), Some(password)) => {
                    Proxy::socks5_with_credentials(address, username, password)
                        .into_diagnostic()
                        .wrap_err_with(|| miette!("Failed to assemble SOCKS5 proxy."))?
                }
                _ => Proxy::socks5(address),
            },
        };

        Ok(proxy)
    }
}
