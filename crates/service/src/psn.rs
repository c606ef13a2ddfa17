//! The secure PSN source.
//!
//! Each endpoint draws a fresh 24-bit non-zero PSN per connection. An
//! off-path attacker who wants to inject or replay packets on the RDMA
//! fabric has to guess this value; a predictable seed (a counter, the
//! time of day) would hand it to them, so the draw comes from the OS
//! entropy pool, with a userspace CSPRNG standing in if the OS source
//! cannot be read.

use codec::Psn;

use rand::rngs::OsRng;
use rand::{Rng, TryRngCore};

/// Draws one fresh PSN in `[1, 2^24 - 1]`.
pub fn generate() -> Psn {
    Psn::new(narrow(random_u32)).unwrap()
}

fn random_u32() -> u32 {
    // The thread RNG is itself a CSPRNG reseeded from the OS, so the
    // fallback loses no strength, only the directness of the source.
    OsRng
        .try_next_u32()
        .unwrap_or_else(|_| rand::rng().random())
}

/// Masks a 32-bit draw down to the 24-bit non-zero PSN range: retry a
/// zero result a few times, then force the low bit.
fn narrow(mut draw: impl FnMut() -> u32) -> u32 {
    for _ in 0..4 {
        let value = draw() & Psn::MAX;
        if value != 0 {
            return value;
        }
    }

    (draw() & Psn::MAX) | 1
}
