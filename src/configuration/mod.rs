mod structure;
mod traits;
mod utilities;

pub use structure::{
    Configuration, EndpointConfiguration, LoggingConfiguration, ProxyConfiguration, ProxyKind,
};
