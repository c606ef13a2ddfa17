//! One session worker: establishment, echo loop, disconnect, teardown.
//!
//! The worker owns everything about its session — the TLS channel, the
//! RDMA resources, both PSNs — and no other thread ever touches them.
//! Its lifetime is the slot's lifetime: admitted, established, serving,
//! disconnecting, released.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use codec::Sentinel;
use service::channel::SentinelReader;
use service::handshake::{self, RECV_WR_ID, SEND_WR_ID};
use service::{
    ControlChannel, DisconnectOutcome, DisconnectTimers, Established,
    SessionError, disconnect, psn,
};
use verbs::Context;

use crate::config::Config;
use crate::registry::Registry;
use crate::shutdown;
use crate::tls::ServerChannel;

/// How long the echo loop lets the TLS poll block per iteration. This
/// also paces the completion-queue polling.
const POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Bound on waiting for in-flight sends to complete while draining.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Runs a session worker to completion. Errors end here as log records;
/// the caller releases the slot either way.
pub fn run(
    id: usize,
    mut chan: ServerChannel,
    addr: SocketAddr,
    config: &Config,
    registry: &Arc<Registry>,
    ctx: &Arc<Context>,
) {
    match drive(id, &mut chan, addr, config, registry, ctx) {
        Ok(outcome) => {
            log::info!(
                "session closed: id={}, addr={:?}, outcome={:?}",
                id,
                addr,
                outcome,
            );
        }
        Err(e) => {
            log::error!("session failed: id={}, addr={:?}, err={}", id, addr, e);
        }
    }

    // RDMA resources are gone by now (dropped inside drive); closing
    // the channel is the second teardown step, the slot release in the
    // caller is the third.
    chan.close();
}

fn drive(
    id: usize,
    chan: &mut ServerChannel,
    addr: SocketAddr,
    config: &Config,
    registry: &Arc<Registry>,
    ctx: &Arc<Context>,
) -> Result<DisconnectOutcome, SessionError> {
    let local_psn = psn::generate();
    let opts = config.resource_options();

    let session = handshake::establish(chan, ctx, &opts, local_psn)?;

    // The PSNs are confidential against off-path observers; keep them
    // out of the default log level.
    log::debug!(
        "session psns: id={}, local={}, remote={}",
        id,
        session.local_psn,
        session.remote_psn,
    );
    log::info!(
        "session open: id={}, addr={:?}, qp_num={}, remote_qp_num={}",
        id,
        addr,
        session.res.qp.qp_num(),
        session.endpoint.qp_num,
    );

    message_loop(id, chan, session, registry)
}

/// The post-establishment echo loop.
///
/// Keeps at least one receive posted at all times, echoes every inbound
/// payload, and watches three disconnect triggers: a sentinel on the
/// TLS channel, a sentinel arriving in-band as an RDMA payload, and the
/// process shutdown flag.
fn message_loop(
    id: usize,
    chan: &mut ServerChannel,
    mut session: Established,
    registry: &Arc<Registry>,
) -> Result<DisconnectOutcome, SessionError> {
    let timers = DisconnectTimers::default();
    let mut sentinels = SentinelReader::default();
    let mut outstanding_sends = 0usize;

    chan.set_read_timeout(Some(POLL_TIMEOUT))?;

    loop {
        if shutdown::requested() || !registry.is_running() {
            log::info!("session draining for shutdown: id={}", id);
            drain_sends(&session, &mut outstanding_sends);
            return Ok(disconnect::initiate(chan, &timers));
        }

        // Inbound RDMA traffic.
        if let Some(wc) = session.res.recv_cq.poll_one()? {
            if !wc.is_success() {
                return Err(SessionError::CompletionFailed(wc.status_str()));
            }

            let len = wc.byte_len();
            if let Some(sentinel) = Sentinel::parse(&session.res.recv_mr.as_slice()[..len]) {
                log::info!(
                    "session got in-band {:?}: id={}, len={}",
                    sentinel,
                    id,
                    len,
                );
                drain_sends(&session, &mut outstanding_sends);
                return Ok(disconnect::respond(chan, &timers));
            }

            echo(id, &mut session, len, &mut outstanding_sends)?;

            // Keep draining RDMA traffic before blocking on the
            // control channel again.
            continue;
        }

        // Send completions.
        while let Some(wc) = session.res.send_cq.poll_one()? {
            if !wc.is_success() {
                return Err(SessionError::CompletionFailed(wc.status_str()));
            }

            outstanding_sends = outstanding_sends.saturating_sub(1);
        }

        // Control-channel traffic; the read timeout paces the loop.
        match sentinels.poll(chan) {
            Ok(Some(Sentinel::Req)) => {
                log::info!("session got disconnect request: id={}", id);
                drain_sends(&session, &mut outstanding_sends);
                return Ok(disconnect::respond(chan, &timers));
            }
            Ok(Some(other)) => {
                log::warn!("session got stray {:?}: id={}", other, id);
            }
            Ok(None) => {}
            Err(e) => return Err(e),
        }
    }
}

/// Echoes one payload: stage it in the send region, post the send,
/// re-post the receive. The copy happens before the re-post so the NIC
/// can never overwrite bytes that are still waiting to go out.
fn echo(
    id: usize,
    session: &mut Established,
    len: usize,
    outstanding_sends: &mut usize,
) -> Result<(), SessionError> {
    // Back-pressure: the send queue depth bounds what may be in flight.
    if *outstanding_sends >= session.res.send_cq.depth() {
        wait_send_slot(session, outstanding_sends)?;
    }

    let payload = session.res.recv_mr.as_slice()[..len].to_vec();
    session.res.send_mr.fill(&payload)?;
    session.res.qp.post_send(&session.res.send_mr, len, SEND_WR_ID)?;
    *outstanding_sends += 1;

    session.res.qp.post_recv(&session.res.recv_mr, RECV_WR_ID)?;

    log::debug!("session echo: id={}, len={}", id, len);
    Ok(())
}

/// Blocks until at least one send completion frees a queue slot.
fn wait_send_slot(
    session: &Established,
    outstanding_sends: &mut usize,
) -> Result<(), SessionError> {
    let deadline = Instant::now() + Duration::from_secs(1);

    loop {
        if let Some(wc) = session.res.send_cq.poll_one()? {
            if !wc.is_success() {
                return Err(SessionError::CompletionFailed(wc.status_str()));
            }

            *outstanding_sends = outstanding_sends.saturating_sub(1);
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(SessionError::CompletionFailed("send queue stalled"));
        }

        sleep(Duration::from_millis(1));
    }
}

/// Lets in-flight sends finish before a disconnect, bounded so a dead
/// peer cannot stall teardown.
fn drain_sends(session: &Established, outstanding_sends: &mut usize) {
    let deadline = Instant::now() + DRAIN_TIMEOUT;

    while *outstanding_sends > 0 && Instant::now() < deadline {
        match session.res.send_cq.poll_one() {
            Ok(Some(_)) => *outstanding_sends -= 1,
            Ok(None) => sleep(Duration::from_millis(1)),
            Err(_) => break,
        }
    }
}
