//! Connection admission handshake
//!
//! The server sends an 8 byte challenge, the client answers with
//! [`scramble`] of it. This only filters out stray or garbage connections; the
//! seed is a clock reading and the transform is public, so it proves nothing
//! about the peer's identity.

use std::time::{SystemTime, UNIX_EPOCH};

/// Bytes exchanged in each direction
pub const HANDSHAKE_LEN: usize = std::mem::size_of::<u64>();

const SCRAMBLE_KEY_IN: u64 = 0xAAAA_DDDD_AAAA_DDDD;
const SCRAMBLE_KEY_OUT: u64 = 0xA16A_D2D5_AAA3_DD47;
const HIGH_NIBBLES: u64 = 0x00F0_F0F0_F0F0_F0F0;
const LOW_NIBBLES: u64 = 0x000F_0F0F_0F0F_0F0F;

/// Deterministic bit transform shared by both ends.
///
/// The nibble masks cover the low seven bytes only; the top byte of the
/// intermediate value is discarded. Peers speaking this protocol rely on that.
pub fn scramble(input: u64) -> u64 {
    let mixed = input ^ SCRAMBLE_KEY_IN;
    let swapped = (mixed & HIGH_NIBBLES) >> 4 | (mixed & LOW_NIBBLES) << 4;
    swapped ^ SCRAMBLE_KEY_OUT
}

/// Handshake values held by one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Handshake {
    /// Value sent to the peer
    pub out: u64,
    /// Value received from the peer
    pub received: u64,
    /// Reply the server expects; unused on the client side
    pub expected: u64,
}

impl Handshake {
    /// Server side: fresh challenge seeded from the system clock
    pub fn challenge() -> Self {
        let out = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self::with_challenge(out)
    }

    pub fn with_challenge(out: u64) -> Self {
        Self {
            out,
            received: 0,
            expected: scramble(out),
        }
    }

    /// Client side: record the challenge and compute the reply
    pub fn answer(&mut self, challenge: u64) -> u64 {
        self.received = challenge;
        self.out = scramble(challenge);
        self.out
    }

    /// Server side: record the reply and check it
    pub fn verify(&mut self, reply: u64) -> bool {
        self.received = reply;
        reply == self.expected
    }
}
