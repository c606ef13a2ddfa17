mod tls;

use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use clap::Parser;
use service::handshake::{self, RECV_WR_ID, SEND_WR_ID};
use service::{
    DisconnectTimers, Established, ResourceOptions, SessionError, disconnect,
    psn,
};
use verbs::{Context, Cq, RtrAttrs, Wc};

use crate::tls::ClientChannel;

#[derive(Parser)]
#[command(
    about = "A client for the secure-PSN RDMA server.",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// server control-channel address, host:port.
    #[arg(long, default_value = "127.0.0.1:4433")]
    server: String,

    /// name the server certificate must be valid for.
    #[arg(long, default_value = "localhost")]
    server_name: String,

    /// trust-anchor pem file; without it the system web roots apply.
    #[arg(long)]
    ca: Option<PathBuf>,

    /// number of messages to send before disconnecting.
    #[arg(long, default_value_t = 1)]
    count: usize,

    /// payload for each message.
    #[arg(long, default_value = "hello")]
    payload: String,

    /// physical port number on the rdma device.
    #[arg(long, default_value_t = 1)]
    port_num: u8,

    /// gid table index on the rdma device.
    #[arg(long, default_value_t = 0)]
    gid_index: u8,

    /// path mtu in bytes.
    #[arg(long, default_value_t = 1024)]
    path_mtu: u32,

    /// log verbosity.
    #[arg(long, default_value = "info")]
    log_level: log::Level,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    simple_logger::init_with_level(cli.log_level)?;

    anyhow::ensure!(!cli.payload.is_empty(), "payload must not be empty");
    anyhow::ensure!(
        codec::Sentinel::parse(cli.payload.as_bytes()).is_none(),
        "payload collides with a disconnect sentinel",
    );

    // The device must exist before any connection is attempted.
    let ctx = Arc::new(Context::open(cli.port_num, cli.gid_index)?);

    let tcp = TcpStream::connect(&cli.server)
        .with_context(|| format!("connect to {}", cli.server))?;
    tcp.set_nodelay(true)?;

    let config = tls::client_config(cli.ca.as_deref())?;
    let mut chan = ClientChannel::connect(config, tcp, &cli.server_name)?;
    log::info!("control channel connected: server={}", cli.server);

    let opts = ResourceOptions {
        rtr: RtrAttrs {
            path_mtu: cli.path_mtu,
            ..RtrAttrs::default()
        },
        ..ResourceOptions::default()
    };

    let mut session = handshake::establish(&mut chan, &ctx, &opts, psn::generate())?;
    log::info!(
        "session open: qp_num={}, remote_qp_num={}",
        session.res.qp.qp_num(),
        session.endpoint.qp_num,
    );

    for i in 0..cli.count {
        echo_once(&mut session, cli.payload.as_bytes())?;
        log::info!("echo verified: seq={}, len={}", i, cli.payload.len());
    }

    let outcome = disconnect::initiate(&mut chan, &DisconnectTimers::default());
    log::info!("disconnected: outcome={:?}", outcome);

    drop(session);
    chan.close();
    Ok(())
}

/// Sends one payload and waits for the server to echo it back verbatim.
fn echo_once(session: &mut Established, payload: &[u8]) -> anyhow::Result<()> {
    session.res.send_mr.fill(payload)?;
    session
        .res
        .qp
        .post_send(&session.res.send_mr, payload.len(), SEND_WR_ID)?;

    let wc = wait_completion(&session.res.send_cq)?;
    anyhow::ensure!(
        wc.is_success(),
        SessionError::CompletionFailed(wc.status_str()),
    );

    let wc = wait_completion(&session.res.recv_cq)?;
    anyhow::ensure!(
        wc.is_success(),
        SessionError::CompletionFailed(wc.status_str()),
    );

    let echoed = &session.res.recv_mr.as_slice()[..wc.byte_len()];
    anyhow::ensure!(
        echoed == payload,
        "echo mismatch: sent {} bytes, got {} bytes",
        payload.len(),
        wc.byte_len(),
    );

    // Restore the standing receive before the next round.
    session.res.qp.post_recv(&session.res.recv_mr, RECV_WR_ID)?;
    Ok(())
}

/// Polls a completion queue until something arrives.
fn wait_completion(cq: &Arc<Cq>) -> anyhow::Result<Wc> {
    let deadline = Instant::now() + Duration::from_secs(5);

    loop {
        if let Some(wc) = cq.poll_one()? {
            return Ok(wc);
        }

        anyhow::ensure!(Instant::now() < deadline, "timed out polling completion");
        sleep(Duration::from_millis(1));
    }
}
