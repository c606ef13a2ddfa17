//! The control-channel seam.
//!
//! All protocol logic reads and writes through [`ControlChannel`]
//! instead of a concrete TLS stream. The server and client binaries
//! implement it over `rustls::StreamOwned`; the tests implement it over
//! in-memory pipes, which is what lets the establishment and disconnect
//! machines be exercised without a network or an RDMA device.

use std::io;
use std::time::{Duration, Instant};

use codec::{ParamsRecord, Psn, PsnRecord, Sentinel};

use crate::error::SessionError;

/// A blocking, reliable, ordered byte stream carrying fixed-layout
/// control records.
///
/// Reads are exact-length; a short read means the peer vanished and is
/// terminal for the session. [`ControlChannel::read_available`] is the
/// one non-exact primitive, used by the post-establishment poll loop,
/// and distinguishes "nothing yet" (`Ok(0)`) from end-of-stream (an
/// `UnexpectedEof` error).
pub trait ControlChannel {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;

    /// Reads whatever is available within the configured read timeout.
    /// Returns `Ok(0)` when the timeout passes without data.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

pub fn send_psn<C: ControlChannel>(
    chan: &mut C,
    psn: Psn,
) -> Result<(), SessionError> {
    let mut buf = Vec::with_capacity(PsnRecord::SIZE);
    PsnRecord { psn }.encode(&mut buf);
    chan.write_all(&buf)?;
    Ok(())
}

pub fn recv_psn<C: ControlChannel>(chan: &mut C) -> Result<Psn, SessionError> {
    let mut buf = [0u8; PsnRecord::SIZE];
    chan.read_exact(&mut buf)?;
    Ok(PsnRecord::decode(&buf)?.psn)
}

pub fn send_params<C: ControlChannel>(
    chan: &mut C,
    params: &ParamsRecord,
) -> Result<(), SessionError> {
    let mut buf = Vec::with_capacity(ParamsRecord::SIZE);
    params.encode(&mut buf);
    chan.write_all(&buf)?;
    Ok(())
}

pub fn recv_params<C: ControlChannel>(
    chan: &mut C,
) -> Result<ParamsRecord, SessionError> {
    let mut buf = [0u8; ParamsRecord::SIZE];
    chan.read_exact(&mut buf)?;
    Ok(ParamsRecord::decode(&buf)?)
}

pub fn send_sentinel<C: ControlChannel>(
    chan: &mut C,
    sentinel: Sentinel,
) -> Result<(), SessionError> {
    chan.write_all(sentinel.as_bytes())?;
    Ok(())
}

/// Accumulates sentinel bytes across short reads.
///
/// After establishment the only records on the TLS channel are the
/// 18-byte disconnect sentinels, but a poll with a short timeout can
/// surface a record in pieces; this keeps the partial bytes between
/// polls so nothing is lost.
#[derive(Default)]
pub struct SentinelReader {
    buf: [u8; Sentinel::LEN],
    filled: usize,
}

impl SentinelReader {
    /// One poll step. `Ok(None)` means no complete record yet.
    pub fn poll<C: ControlChannel>(
        &mut self,
        chan: &mut C,
    ) -> Result<Option<Sentinel>, SessionError> {
        let n = chan.read_available(&mut self.buf[self.filled..])?;
        self.filled += n;

        if self.filled < Sentinel::LEN {
            return Ok(None);
        }

        self.filled = 0;
        match Sentinel::parse(&self.buf) {
            Some(sentinel) => Ok(Some(sentinel)),
            // Nothing but sentinels is legal here.
            None => Err(SessionError::TlsIoFailed(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected control record",
            ))),
        }
    }

    /// Polls until a sentinel arrives or the deadline passes.
    /// `Ok(None)` is the timeout; channel failures are returned as-is.
    pub fn wait<C: ControlChannel>(
        &mut self,
        chan: &mut C,
        timeout: Duration,
    ) -> Result<Option<Sentinel>, SessionError> {
        const POLL_INTERVAL: Duration = Duration::from_millis(25);

        let deadline = Instant::now() + timeout;
        chan.set_read_timeout(Some(POLL_INTERVAL)).map_err(SessionError::TlsIoFailed)?;

        loop {
            if let Some(sentinel) = self.poll(chan)? {
                return Ok(Some(sentinel));
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};

    /// An in-memory control channel; `pair()` returns both ends of a
    /// bidirectional pipe.
    pub struct PipeChannel {
        tx: Sender<Vec<u8>>,
        rx: Receiver<Vec<u8>>,
        pending: VecDeque<u8>,
        timeout: Duration,
    }

    pub fn pair() -> (PipeChannel, PipeChannel) {
        let (a_tx, a_rx) = channel();
        let (b_tx, b_rx) = channel();

        (
            PipeChannel {
                tx: a_tx,
                rx: b_rx,
                pending: VecDeque::new(),
                timeout: Duration::from_secs(5),
            },
            PipeChannel {
                tx: b_tx,
                rx: a_rx,
                pending: VecDeque::new(),
                timeout: Duration::from_secs(5),
            },
        )
    }

    impl PipeChannel {
        fn fill_pending(&mut self) -> io::Result<bool> {
            match self.rx.recv_timeout(self.timeout) {
                Ok(bytes) => {
                    self.pending.extend(bytes);
                    Ok(true)
                }
                Err(RecvTimeoutError::Timeout) => Ok(false),
                Err(RecvTimeoutError::Disconnected) => {
                    Err(io::Error::from(io::ErrorKind::UnexpectedEof))
                }
            }
        }
    }

    impl ControlChannel for PipeChannel {
        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            self.tx
                .send(buf.to_vec())
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
            while self.pending.len() < buf.len() {
                if !self.fill_pending()? {
                    return Err(io::Error::from(io::ErrorKind::TimedOut));
                }
            }

            for slot in buf.iter_mut() {
                *slot = self.pending.pop_front().unwrap();
            }

            Ok(())
        }

        fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() && !self.fill_pending()? {
                return Ok(0);
            }

            let n = buf.len().min(self.pending.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.pending.pop_front().unwrap();
            }

            Ok(n)
        }

        fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
            self.timeout = timeout.unwrap_or(Duration::from_secs(3600));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::pair;
    use super::*;

    #[test]
    fn psn_round_trip() {
        let (mut a, mut b) = pair();

        let psn = Psn::new(0x2807d5).unwrap();
        send_psn(&mut a, psn).unwrap();
        assert_eq!(recv_psn(&mut b).unwrap(), psn);
    }

    #[test]
    fn params_round_trip() {
        let (mut a, mut b) = pair();

        let params = ParamsRecord {
            qp_num: 42,
            lid: 7,
            gid: [9u8; 16],
            psn: Psn::new(0x9f8541).unwrap(),
        };

        send_params(&mut a, &params).unwrap();
        assert_eq!(recv_params(&mut b).unwrap(), params);
    }

    #[test]
    fn zero_psn_on_wire_is_rejected() {
        let (mut a, mut b) = pair();

        a.write_all(&[0, 0, 0, 0]).unwrap();
        assert!(matches!(
            recv_psn(&mut b),
            Err(SessionError::PsnOutOfRange(0))
        ));
    }

    #[test]
    fn closed_pipe_is_peer_closed() {
        let (a, mut b) = pair();
        drop(a);

        assert!(matches!(
            recv_psn(&mut b),
            Err(SessionError::PeerClosedUnexpectedly)
        ));
    }

    #[test]
    fn sentinel_reader_handles_split_records() {
        let (mut a, mut b) = pair();
        b.set_read_timeout(Some(Duration::from_millis(50))).unwrap();

        let bytes = Sentinel::Req.as_bytes();
        a.write_all(&bytes[..7]).unwrap();

        let mut reader = SentinelReader::default();
        assert_eq!(reader.poll(&mut b).unwrap(), None);

        a.write_all(&bytes[7..]).unwrap();
        assert_eq!(reader.poll(&mut b).unwrap(), Some(Sentinel::Req));
    }

    #[test]
    fn sentinel_reader_rejects_unknown_record() {
        let (mut a, mut b) = pair();
        b.set_read_timeout(Some(Duration::from_millis(50))).unwrap();

        a.write_all(b"$$NOT_A_SENTINEL$$").unwrap();

        let mut reader = SentinelReader::default();
        assert!(matches!(
            reader.poll(&mut b),
            Err(SessionError::TlsIoFailed(_))
        ));
    }

    #[test]
    fn sentinel_wait_times_out() {
        let (_a, mut b) = pair();

        let mut reader = SentinelReader::default();
        let got = reader
            .wait(&mut b, Duration::from_millis(80))
            .unwrap();
        assert_eq!(got, None);
    }
}
