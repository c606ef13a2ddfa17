pub mod config;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod tls;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use config::Config;
use registry::Registry;
use verbs::Context;

/// Grace period for workers to finish their disconnect handshakes after
/// shutdown is requested, before the device context goes away.
const DRAIN_DEADLINE: Duration = Duration::from_secs(8);

/// In order to let the integration tests use this crate directly and
/// start the server, a function is opened to replace the main function.
///
/// Startup order matters: the device context opens before the listener
/// so a machine without an RDMA device fails fast instead of accepting
/// connections it can never serve, and it closes only after every
/// session slot has been released.
pub fn server_main(config: Arc<Config>) -> anyhow::Result<()> {
    shutdown::install()?;

    let tls = tls::server_config(&config.tls)?;
    let ctx = Arc::new(Context::open(
        config.rdma.port_num,
        config.rdma.gid_index,
    )?);
    let registry = Registry::new(config.max_clients);

    server::run(config, tls, registry.clone(), ctx.clone())?;

    // Workers observe the flag between poll iterations; give their
    // disconnect handshakes a bounded window to finish.
    let deadline = Instant::now() + DRAIN_DEADLINE;
    while !registry.is_idle() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }

    if !registry.is_idle() {
        log::warn!(
            "shutdown with sessions still draining: clients={}",
            registry.num_clients(),
        );
    }

    drop(ctx);
    log::info!("server exited");
    Ok(())
}
