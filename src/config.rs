use std::fs::read_to_string;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;
use verbs::{RtrAttrs, RtsAttrs};

#[derive(Deserialize, Debug, Clone)]
pub struct Tls {
    /// tls listen address
    ///
    /// the address and port the control-channel listener binds. one
    /// client connection is accepted per session; the rdma fabric
    /// carries the data path separately.
    #[serde(default = "Tls::listen")]
    pub listen: SocketAddr,

    /// server certificate chain, pem format.
    #[serde(default = "Tls::cert")]
    pub cert: PathBuf,

    /// server private key, pem format.
    #[serde(default = "Tls::key")]
    pub key: PathBuf,

    /// require client certificates
    ///
    /// when enabled, clients must present a certificate that chains to
    /// the trust anchors in `ca`. this is policy, not protocol: the psn
    /// exchange works the same either way.
    #[serde(default)]
    pub require_client_auth: bool,

    /// trust anchors for client certificates, pem format. only read
    /// when `require_client_auth` is enabled.
    #[serde(default)]
    pub ca: Option<PathBuf>,
}

impl Tls {
    fn listen() -> SocketAddr {
        "0.0.0.0:4433".parse().unwrap()
    }

    fn cert() -> PathBuf {
        PathBuf::from("server.crt")
    }

    fn key() -> PathBuf {
        PathBuf::from("server.key")
    }
}

impl Default for Tls {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            cert: Self::cert(),
            key: Self::key(),
            require_client_auth: false,
            ca: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
pub struct Rdma {
    /// physical port number on the device, counted from one.
    #[serde(default = "Rdma::port_num")]
    pub port_num: u8,

    /// gid table index
    ///
    /// index zero is right for plain infiniband; roce fabrics usually
    /// want the index of a routable (v2) gid entry.
    #[serde(default)]
    pub gid_index: u8,

    /// path mtu in bytes
    ///
    /// must be one of 256, 512, 1024, 2048 or 4096. the default is a
    /// conventional value, not a measured one.
    #[serde(default = "Rdma::path_mtu")]
    pub path_mtu: u32,

    /// completion queue depth, which also bounds the outstanding work
    /// requests per session.
    #[serde(default = "Rdma::cq_depth")]
    pub cq_depth: u32,

    /// pinned buffer size per direction, in bytes.
    #[serde(default = "Rdma::buffer_size")]
    pub buffer_size: usize,
}

impl Rdma {
    fn port_num() -> u8 {
        1
    }

    fn path_mtu() -> u32 {
        1024
    }

    fn cq_depth() -> u32 {
        10
    }

    fn buffer_size() -> usize {
        4096
    }
}

impl Default for Rdma {
    fn default() -> Self {
        Self {
            port_num: Self::port_num(),
            gid_index: 0,
            path_mtu: Self::path_mtu(),
            cq_depth: Self::cq_depth(),
            buffer_size: Self::buffer_size(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub tls: Tls,
    #[serde(default)]
    pub rdma: Rdma,
    #[serde(default)]
    pub log: Log,

    /// session capacity
    ///
    /// the fixed number of registry slots. a connection arriving while
    /// every slot is taken is closed right after its tls handshake,
    /// before any rdma resource exists for it.
    #[serde(default = "Config::max_clients")]
    pub max_clients: usize,
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// specify the configuration file path.
    #[arg(long)]
    config: Option<String>,

    /// override the tls listen address.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// override the session capacity.
    #[arg(long)]
    max_clients: Option<usize>,

    /// override the server certificate path.
    #[arg(long)]
    cert: Option<PathBuf>,

    /// override the server private key path.
    #[arg(long)]
    key: Option<PathBuf>,
}

impl Config {
    fn max_clients() -> usize {
        10
    }

    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used. Direct flags win
    /// over the file.
    pub fn load() -> anyhow::Result<Self> {
        let cli = Cli::parse();

        let cfg_str = cli
            .config
            .map(read_to_string)
            .transpose()?
            .unwrap_or_else(|| "{}".to_string());
        let mut config: Self = serde_json5::from_str(&cfg_str)?;

        if let Some(listen) = cli.listen {
            config.tls.listen = listen;
        }

        if let Some(max_clients) = cli.max_clients {
            config.max_clients = max_clients;
        }

        if let Some(cert) = cli.cert {
            config.tls.cert = cert;
        }

        if let Some(key) = cli.key {
            config.tls.key = key;
        }

        Ok(config)
    }

    /// The per-session resource sizing this configuration asks for.
    pub fn resource_options(&self) -> service::ResourceOptions {
        service::ResourceOptions {
            cq_depth: self.rdma.cq_depth,
            buffer_size: self.rdma.buffer_size,
            rtr: RtrAttrs {
                path_mtu: self.rdma.path_mtu,
                ..RtrAttrs::default()
            },
            rts: RtsAttrs::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_everything() {
        let config: Config = serde_json5::from_str("{}").unwrap();
        assert_eq!(config.tls.listen.port(), 4433);
        assert_eq!(config.max_clients, 10);
        assert_eq!(config.rdma.path_mtu, 1024);
        assert_eq!(config.rdma.cq_depth, 10);
        assert!(!config.tls.require_client_auth);
    }

    #[test]
    fn file_values_override_defaults() {
        let config: Config = serde_json5::from_str(
            r#"{
                tls: { listen: "127.0.0.1:9000", require_client_auth: true },
                rdma: { path_mtu: 4096 },
                max_clients: 3,
            }"#,
        )
        .unwrap();

        assert_eq!(config.tls.listen.port(), 9000);
        assert!(config.tls.require_client_auth);
        assert_eq!(config.rdma.path_mtu, 4096);
        assert_eq!(config.max_clients, 3);
    }
}
