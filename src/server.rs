//! The listener and admission path.
//!
//! One thread blocks (well, polls) on the TCP listener; every accepted
//! connection gets its own thread that runs the TLS handshake, asks the
//! registry for a slot and, if admitted, becomes that session's worker
//! until teardown. A connection that finds the registry full is closed
//! right after the handshake — no slot, no RDMA resources, no session.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rustls::ServerConfig;
use service::SessionError;
use verbs::Context;

use crate::config::Config;
use crate::registry::Registry;
use crate::session;
use crate::shutdown;
use crate::tls::ServerChannel;

/// How often the accept loop checks the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Runs the accept loop until shutdown is requested. Returns once no
/// new connections will be admitted; running sessions drain on their
/// own threads.
pub fn run(
    config: Arc<Config>,
    tls: Arc<ServerConfig>,
    registry: Arc<Registry>,
    ctx: Arc<Context>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.tls.listen)?;
    listener.set_nonblocking(true)?;

    log::info!(
        "server listening: addr={}, capacity={}",
        config.tls.listen,
        registry.capacity(),
    );

    while !shutdown::requested() {
        match listener.accept() {
            Ok((tcp, addr)) => {
                let config = config.clone();
                let tls = tls.clone();
                let registry = registry.clone();
                let ctx = ctx.clone();

                thread::spawn(move || {
                    handle_connection(tcp, addr, &config, tls, &registry, &ctx)
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                log::error!("tcp accept failed: err={}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }

    registry.begin_shutdown();
    log::info!("server stopped accepting");
    Ok(())
}

fn handle_connection(
    tcp: TcpStream,
    addr: SocketAddr,
    config: &Config,
    tls: Arc<ServerConfig>,
    registry: &Arc<Registry>,
    ctx: &Arc<Context>,
) {
    log::info!("tcp accept: addr={:?}", addr);

    // The control channel is latency-sensitive during the handshakes.
    if let Err(e) = tcp.set_nodelay(true) {
        log::error!("tcp set nodelay failed: addr={:?}, err={}", addr, e);
    }

    let mut chan = match ServerChannel::accept(tls, tcp) {
        Ok(chan) => chan,
        Err(e) => {
            log::warn!("tls accept failed: addr={:?}, err={}", addr, e);
            return;
        }
    };

    // Admission: claim a slot or close. A rejected connection never
    // creates any RDMA resource.
    let Some(id) = registry.admit(addr) else {
        log::warn!(
            "session rejected: addr={:?}, err={}",
            addr,
            SessionError::CapacityExceeded,
        );
        chan.close();
        return;
    };

    log::info!(
        "session admitted: id={}, addr={:?}, clients={}",
        id,
        addr,
        registry.num_clients(),
    );

    session::run(id, chan, addr, config, registry, ctx);

    registry.release(id);
    log::info!(
        "session slot released: id={}, addr={:?}, clients={}",
        id,
        addr,
        registry.num_clients(),
    );
}
