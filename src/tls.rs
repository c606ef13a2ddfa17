//! The server side of the TLS control channel.
//!
//! rustls with its default provider negotiates TLS 1.2 or newer and
//! offers only forward-secret AEAD suites, which is exactly the cipher
//! policy the control channel requires: the PSNs and queue pair
//! addressing cross this channel and must never be visible to an
//! off-path observer.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, ServerConnection, StreamOwned};
use service::{ControlChannel, SessionError};

use crate::config;

fn load_certs(path: &Path) -> anyhow::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("open certificate file {:?}", path))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .context("parse certificate file")?;

    anyhow::ensure!(!certs.is_empty(), "no certificates in {:?}", path);
    Ok(certs)
}

/// Builds the process-wide rustls server configuration from the
/// certificate material on disk. Client-certificate authentication is a
/// toggle; when enabled the `ca` file provides the trust anchors.
pub fn server_config(tls: &config::Tls) -> anyhow::Result<Arc<ServerConfig>> {
    let certs = load_certs(&tls.cert)?;

    let key = {
        let file = File::open(&tls.key)
            .with_context(|| format!("open private key file {:?}", tls.key))?;
        rustls_pemfile::private_key(&mut BufReader::new(file))
            .context("parse private key file")?
            .context("no private key found")?
    };

    let builder = if tls.require_client_auth {
        let ca = tls
            .ca
            .as_ref()
            .context("require_client_auth is set but no ca file is configured")?;

        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca)? {
            roots.add(cert).context("add client trust anchor")?;
        }

        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .context("build client certificate verifier")?;
        ServerConfig::builder().with_client_cert_verifier(verifier)
    } else {
        ServerConfig::builder().with_no_client_auth()
    };

    let config = builder
        .with_single_cert(certs, key)
        .context("assemble tls server config")?;

    Ok(Arc::new(config))
}

/// One accepted control channel, handshake already complete.
pub struct ServerChannel {
    stream: StreamOwned<ServerConnection, TcpStream>,
}

impl ServerChannel {
    /// Runs the TLS handshake eagerly so a failure surfaces here, as
    /// `TlsHandshakeFailed`, and never inside the first record read.
    pub fn accept(
        config: Arc<ServerConfig>,
        tcp: TcpStream,
    ) -> Result<Self, SessionError> {
        let conn = ServerConnection::new(config).map_err(|e| {
            SessionError::TlsHandshakeFailed(io::Error::new(
                io::ErrorKind::InvalidData,
                e,
            ))
        })?;

        let mut stream = StreamOwned::new(conn, tcp);
        while stream.conn.is_handshaking() {
            stream
                .conn
                .complete_io(&mut stream.sock)
                .map_err(SessionError::TlsHandshakeFailed)?;
        }

        Ok(Self { stream })
    }

    /// Flushes the close-notify alert and shuts the socket down. Safe to
    /// call on an already-dead connection.
    pub fn close(&mut self) {
        self.stream.conn.send_close_notify();
        let _ = self.stream.flush();
        let _ = self.stream.sock.shutdown(std::net::Shutdown::Both);
    }
}

impl ControlChannel for ServerChannel {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf)?;
        self.stream.flush()
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.stream.read_exact(buf)
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf) {
            Ok(0) => Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.sock.set_read_timeout(timeout)
    }
}
