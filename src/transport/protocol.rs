//! Underlying transport connectors.
//!
//! A connector knows how to establish one kind of connection to one
//! server. The datagram and stream exchanges are generic over connectors
//! so tests can substitute loopback servers without touching the
//! dispatcher.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::{ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::{
    Certificate, ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName,
};
use tokio_rustls::TlsConnector;

/// Bind attempts per query socket.
///
/// Every query gets a fresh socket on a kernel-chosen port so that
/// response matching cannot be poisoned by a long-lived port. The
/// kernel can still hand out a port that races another bind; a handful
/// of fresh attempts papers over that.
const LOCAL_BIND_ATTEMPTS: usize = 10;

//------------ AsyncConnect --------------------------------------------------

/// Establishes a connection asynchronously.
pub trait AsyncConnect {
    /// The type of an established connection.
    type Connection;

    /// The future establishing the connection.
    type Fut: Future<Output = Result<Self::Connection, io::Error>> + Send;

    /// Returns a future establishing a connection.
    fn connect(&self) -> Self::Fut;
}

//------------ UdpConnect ----------------------------------------------------

/// Creates connected UDP sockets towards one server.
#[derive(Clone, Copy, Debug)]
pub struct UdpConnect {
    /// Remote address to connect to.
    addr: SocketAddr,
}

impl UdpConnect {
    /// Creates a connector for the given server.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// The remote address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Binds a fresh ephemeral-port socket and connects it.
    async fn bind_and_connect(self) -> Result<UdpSocket, io::Error> {
        let unspecified: SocketAddr = match self.addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let mut last_err = None;
        for _ in 0..LOCAL_BIND_ATTEMPTS {
            match UdpSocket::bind(unspecified).await {
                Ok(sock) => {
                    sock.connect(self.addr).await?;
                    return Ok(sock);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.expect("at least one bind attempt was made"))
    }
}

impl AsyncConnect for UdpConnect {
    type Connection = UdpSocket;
    type Fut = Pin<
        Box<
            dyn Future<Output = Result<Self::Connection, std::io::Error>>
                + Send,
        >,
    >;

    fn connect(&self) -> Self::Fut {
        Box::pin(self.bind_and_connect())
    }
}

//------------ TcpConnect ----------------------------------------------------

/// Creates new TCP connections towards one server.
#[derive(Clone, Copy, Debug)]
pub struct TcpConnect {
    /// Remote address to connect to.
    addr: SocketAddr,
}

impl TcpConnect {
    /// Creates a connector for the given server.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl AsyncConnect for TcpConnect {
    type Connection = TcpStream;
    type Fut = Pin<
        Box<
            dyn Future<Output = Result<Self::Connection, std::io::Error>>
                + Send,
        >,
    >;

    fn connect(&self) -> Self::Fut {
        let addr = self.addr;
        Box::pin(async move { TcpStream::connect(addr).await })
    }
}

//------------ TlsConnect ----------------------------------------------------

/// Creates new TLS connections towards one server.
#[derive(Clone)]
pub struct TlsConnect {
    /// Configuration for setting up a TLS connection.
    client_config: Arc<ClientConfig>,

    /// Server name for certificate verification.
    server_name: ServerName,

    /// Remote address to connect to.
    addr: SocketAddr,
}

impl TlsConnect {
    /// Creates a connector for the given server.
    pub fn new(
        client_config: impl Into<Arc<ClientConfig>>,
        server_name: ServerName,
        addr: SocketAddr,
    ) -> Self {
        Self {
            client_config: client_config.into(),
            server_name,
            addr,
        }
    }

    /// Returns the remote address this connector connects to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl std::fmt::Debug for TlsConnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnect")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl AsyncConnect for TlsConnect {
    type Connection = TlsStream<TcpStream>;
    type Fut = Pin<
        Box<
            dyn Future<Output = Result<Self::Connection, std::io::Error>>
                + Send,
        >,
    >;

    fn connect(&self) -> Self::Fut {
        let tls_connector = TlsConnector::from(self.client_config.clone());
        let server_name = self.server_name.clone();
        let addr = self.addr;
        Box::pin(async move {
            let tcp = TcpStream::connect(addr).await?;
            tls_connector.connect(server_name, tcp).await
        })
    }
}

//------------ TLS client configuration --------------------------------------

/// Builds a verifying TLS configuration.
///
/// Extra PEM material from the resolver configuration is added to the
/// bundled root set; the pinned hostname is checked against it during the
/// handshake.
pub fn verifying_tls_config(
    ca_pem: Option<&str>,
) -> Result<Arc<ClientConfig>, io::Error> {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(
        |ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        },
    ));
    if let Some(pem) = ca_pem {
        for der in rustls_pemfile::certs(&mut pem.as_bytes())? {
            roots.add(&Certificate(der)).map_err(|err| {
                io::Error::new(io::ErrorKind::InvalidData, err)
            })?;
        }
    }
    Ok(Arc::new(
        ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    ))
}

/// Builds a TLS configuration that accepts any certificate.
///
/// Used in opportunistic mode where no hostname is pinned: the session is
/// still encrypted, authentication is not required.
pub fn opportunistic_tls_config() -> Arc<ClientConfig> {
    Arc::new(
        ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth(),
    )
}

/// Returns the server name to present during the handshake.
///
/// With a pinned provider hostname that name is used so verification can
/// succeed; otherwise the bare address is presented.
pub fn tls_server_name(
    addr: SocketAddr,
    provider: Option<&str>,
) -> ServerName {
    provider
        .and_then(|name| ServerName::try_from(name).ok())
        .unwrap_or(ServerName::IpAddress(addr.ip()))
}

/// A certificate verifier that accepts everything.
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

//============ Tests =========================================================
