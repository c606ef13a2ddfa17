//! The client side of the TLS control channel.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use service::{ControlChannel, SessionError};

/// Builds the rustls client configuration. With `--ca` the given PEM
/// file is the only trust anchor (the usual arrangement for a privately
/// provisioned fabric); without it the Mozilla root bundle applies.
pub fn client_config(ca: Option<&Path>) -> anyhow::Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();

    match ca {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("open trust anchor file {:?}", path))?;
            for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
                roots
                    .add(cert.context("parse trust anchor file")?)
                    .context("add trust anchor")?;
            }

            anyhow::ensure!(!roots.is_empty(), "no certificates in {:?}", path);
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// One connected control channel, handshake already complete.
pub struct ClientChannel {
    stream: StreamOwned<ClientConnection, TcpStream>,
}

impl ClientChannel {
    /// Connects TLS over an established TCP stream, verifying the
    /// server certificate against `server_name`.
    pub fn connect(
        config: Arc<ClientConfig>,
        tcp: TcpStream,
        server_name: &str,
    ) -> Result<Self, SessionError> {
        let name = ServerName::try_from(server_name.to_owned()).map_err(|e| {
            SessionError::TlsHandshakeFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                e,
            ))
        })?;

        let conn = ClientConnection::new(config, name).map_err(|e| {
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

    pub fn close(&mut self) {
        self.stream.conn.send_close_notify();
        let _ = self.stream.flush();
        let _ = self.stream.sock.shutdown(std::net::Shutdown::Both);
    }
}

impl ControlChannel for ClientChannel {
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
