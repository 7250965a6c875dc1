//! TCP sockets, endpoint addressing and the TLS hook.
//!
//! Transport security is consumed as an opaque capability: a
//! [`TlsUpgrade`] turns an accepted or connected `TcpStream` into a boxed
//! stream. Key stores and cipher policy live entirely in the implementation.
//!
//! # Example
//!
//! ```
//! use highway_transport::transport::Endpoint;
//!
//! let endpoint: Endpoint = "highway://10.0.0.5:7070?sslEnabled=true".parse().unwrap();
//! assert_eq!(endpoint.address(), "10.0.0.5:7070");
//! assert!(endpoint.ssl_enabled());
//! ```

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{HighwayError, Result};
use crate::BoxFuture;

const SCHEME: &str = "highway://";

/// Byte stream usable as a Highway connection.
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> IoStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased connection stream (plain TCP or upgraded).
pub type BoxedStream = Box<dyn IoStream>;

/// Upgrades plain TCP streams to secure ones.
pub trait TlsUpgrade: Send + Sync + 'static {
    /// Client side: run the handshake towards `endpoint`.
    fn connect(&self, endpoint: &Endpoint, stream: TcpStream)
        -> BoxFuture<'static, io::Result<BoxedStream>>;

    /// Server side: run the handshake for an accepted socket.
    fn accept(&self, stream: TcpStream) -> BoxFuture<'static, io::Result<BoxedStream>>;
}

/// Destination address plus transport-security flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
    ssl_enabled: bool,
}

impl Endpoint {
    /// Plain endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ssl_enabled: false,
        }
    }

    /// Endpoint for a socket address.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }

    /// Set the transport-security flag.
    pub fn with_ssl(mut self, ssl_enabled: bool) -> Self {
        self.ssl_enabled = ssl_enabled;
        self
    }

    /// Host name or IP.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the connection must be upgraded with TLS.
    pub fn ssl_enabled(&self) -> bool {
        self.ssl_enabled
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", SCHEME, self.address())?;
        if self.ssl_enabled {
            f.write_str("?sslEnabled=true")?;
        }
        Ok(())
    }
}

impl FromStr for Endpoint {
    type Err = HighwayError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid =
            |why: &str| HighwayError::Config(format!("Invalid endpoint '{}': {}", s, why));

        let rest = s.strip_prefix(SCHEME).unwrap_or(s);
        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };

        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;

        let mut ssl_enabled = false;
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            if let Some(value) = pair.strip_prefix("sslEnabled=") {
                ssl_enabled = value.eq_ignore_ascii_case("true");
            }
        }

        Ok(Self {
            host: host.to_string(),
            port,
            ssl_enabled,
        })
    }
}

/// Open a connection to `endpoint`, upgrading it if the endpoint asks for TLS.
pub async fn connect(
    endpoint: &Endpoint,
    tls: Option<&Arc<dyn TlsUpgrade>>,
) -> Result<BoxedStream> {
    let upgrade = match (endpoint.ssl_enabled(), tls) {
        (true, None) => {
            return Err(HighwayError::Config(format!(
                "{} requires TLS but no upgrade is configured",
                endpoint
            )))
        }
        (true, Some(tls)) => Some(tls),
        (false, _) => None,
    };

    let stream = TcpStream::connect(endpoint.address()).await?;
    stream.set_nodelay(true)?;

    match upgrade {
        Some(tls) => Ok(tls.connect(endpoint, stream).await?),
        None => Ok(Box::new(stream)),
    }
}

/// Bind a listener on `address`.
pub async fn bind(address: &str) -> Result<TcpListener> {
    Ok(TcpListener::bind(address).await?)
}

/// Prepare an accepted socket, running the TLS handshake if configured.
pub async fn accept_stream(
    stream: TcpStream,
    tls: Option<&Arc<dyn TlsUpgrade>>,
) -> Result<BoxedStream> {
    stream.set_nodelay(true)?;
    match tls {
        Some(tls) => Ok(tls.accept(stream).await?),
        None => Ok(Box::new(stream)),
    }
}
