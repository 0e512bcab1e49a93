//! Addressing of a single converter instance

use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol spoken on top of the bridge socket
pub const BRIDGE_PROTOCOL: &str = "urp";

/// Name of the root object retrieved once a bridge is established
pub const ROOT_OBJECT_NAME: &str = "StarOffice.ServiceManager";

/// How to reach one converter instance.
///
/// The accept string is handed to the spawned process so it listens on the
/// endpoint; the connect string is what a bridge uses to reach it. Both are
/// derived once at construction and never change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointAddress {
    host: String,
    port: u16,
    accept_string: String,
    connect_string: String,
}

impl EndpointAddress {
    /// Create a socket endpoint for the given host and port
    pub fn socket(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let accept_string = format!("socket,host={},port={},tcpNoDelay=1", host, port);
        let connect_string = format!(
            "uno:{};{};{}",
            accept_string, BRIDGE_PROTOCOL, ROOT_OBJECT_NAME
        );

        Self {
            host,
            port,
            accept_string,
            connect_string,
        }
    }

    /// Create a socket endpoint on the loopback interface
    pub fn local(port: u16) -> Self {
        Self::socket("127.0.0.1", port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn accept_string(&self) -> &str {
        &self.accept_string
    }

    pub fn connect_string(&self) -> &str {
        &self.connect_string
    }

    /// `host:port` form suitable for socket APIs
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The `-accept=` argument passed to the converter executable
    pub fn accept_argument(&self) -> String {
        format!("-accept={};{};", self.accept_string, BRIDGE_PROTOCOL)
    }

    /// Directory name of the instance-private user profile.
    ///
    /// Derived only from the accept string, so two endpoints that differ in
    /// host or port never share a profile directory.
    pub fn profile_dir_name(&self) -> String {
        format!(
            ".officevisor_{}",
            self.accept_string.replace(',', "_").replace('=', "-")
        )
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.accept_string)
    }
}
