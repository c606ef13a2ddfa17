//! Shared helpers: throwaway certificates and a raw client-side control
//! channel, so the integration tests can speak to the server exactly the
//! way the real client binary does.

use std::fs;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use service::ControlChannel;

/// Self-signed certificate material written to disk, the way a
/// deployment would provision it.
pub struct TestCerts {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pem: String,
}

impl TestCerts {
    pub fn generate(tag: &str) -> Self {
        let certified =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

        let dir = std::env::temp_dir().join(format!(
            "rdma-server-test-{}-{}",
            tag,
            std::process::id(),
        ));
        fs::create_dir_all(&dir).unwrap();

        let cert_path = dir.join("server.crt");
        let key_path = dir.join("server.key");
        let pem = certified.cert.pem();

        fs::write(&cert_path, &pem).unwrap();
        fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

        Self {
            cert_path,
            key_path,
            pem,
        }
    }

    /// A client config trusting exactly this certificate.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut self.pem.as_bytes()) {
            roots.add(cert.unwrap()).unwrap();
        }

        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }
}

/// Client end of the control channel, mirroring the client binary's
/// stream handling.
pub struct TestChannel {
    pub stream: StreamOwned<ClientConnection, TcpStream>,
}

impl TestChannel {
    pub fn connect(config: Arc<ClientConfig>, tcp: TcpStream) -> Self {
        let name = ServerName::try_from("localhost".to_owned()).unwrap();
        let conn = ClientConnection::new(config, name).unwrap();

        let mut stream = StreamOwned::new(conn, tcp);
        while stream.conn.is_handshaking() {
            stream.conn.complete_io(&mut stream.sock).unwrap();
        }

        Self { stream }
    }
}

impl ControlChannel for TestChannel {
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
