//! Initial sequence number generation, as recommended by rfc6528.
//!
//! Uses a keyed cryptographic hash function (SipHash-2-4) over the
//! connection four tuple:
//!
//! > ISN = M + SipHash-2-4(secretkey, localip, localport, remoteip,
//! > remoteport)
use crate::time::Instant;
use crate::wire::{IpEndpoint, TcpSeqNumber};

/// An initial sequence number generator based on SipHash-2-4.
pub(crate) struct IsnGenerator {
    keys: (u64, u64),
}

// Yes, that's the initial values, as ASCII text.
const IV: [&[u8; 8]; 4] = [
    b"somepseu",
    b"dorandom",
    b"lygenera",
    b"tedbytes"];

struct State {
    v0: u64,
    v1: u64,
    v2: u64,
    v3: u64,
}

impl IsnGenerator {
    /// Create a generator by deriving a key from the standard
    /// `RandomState`.
    ///
    /// The numbers `0u64` and `1u64` are hashed with two clones of the same
    /// freshly seeded hasher; the two output tags become the internal key
    /// state.
    pub(crate) fn from_std_hash() -> Self {
        use std::collections::hash_map::RandomState;
        use std::hash::{BuildHasher, Hasher};

        let hash = RandomState::new().build_hasher();
        let x0 = {
            let mut hash = hash.clone();
            hash.write_u64(0);
            hash.finish()
        };
        let x1 = {
            let mut hash = hash.clone();
            hash.write_u64(1);
            hash.finish()
        };

        IsnGenerator { keys: (x0, x1) }
    }

    #[cfg(test)]
    pub(crate) fn from_key(a: u64, b: u64) -> Self {
        IsnGenerator { keys: (a, b) }
    }

    /// Get the initial sequence number for a connection.
    ///
    /// The value varies every 4ms and with the secret key.
    pub(crate) fn get_isn(
        &self,
        local: IpEndpoint,
        foreign: IpEndpoint,
        time: Instant,
    ) -> TcpSeqNumber {
        let mut state = State::init(self.keys.0, self.keys.1);

        let m = u64::from(local.addr.to_network_integer())
            | u64::from(foreign.addr.to_network_integer()) << 32;
        let p = u64::from(local.port)
            | u64::from(foreign.port) << 16
            // Message length = 12
            | 12_u64 << 56;
        state.absorb(m);
        state.absorb(p);
        let num = state.finalize();

        TcpSeqNumber(num as i32) + (time.total_millis() / 4) as usize % (1 << 20)
    }
}

impl State {
    const SIP_C: usize = 2;
    const SIP_D: usize = 4;

    fn init(k0: u64, k1: u64) -> Self {
        State {
            v0: u64::from_be_bytes(*IV[0]) ^ k0,
            v1: u64::from_be_bytes(*IV[1]) ^ k1,
            v2: u64::from_be_bytes(*IV[2]) ^ k0,
            v3: u64::from_be_bytes(*IV[3]) ^ k1,
        }
    }

    fn round(&mut self) {
        self.v0 = self.v0.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(13);
        self.v1 ^= self.v0;
        self.v0 = self.v0.rotate_left(32);
        self.v2 = self.v2.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(16);
        self.v3 ^= self.v2;
        self.v0 = self.v0.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(21);
        self.v3 ^= self.v0;
        self.v2 = self.v2.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(17);
        self.v1 ^= self.v2;
        self.v2 = self.v2.rotate_left(32);
    }

    /// Process a single portion of the message.
    ///
    /// The length byte is folded into the final block by the caller, which
    /// keeps every block a plain 8-byte constant.
    fn absorb(&mut self, m: u64) {
        self.v3 ^= m;
        (0..Self::SIP_C).for_each(|_| self.round());
        self.v0 ^= m;
    }

    /// Do the finalization rounds.
    fn finalize(mut self) -> u64 {
        self.v2 ^= 0xff;
        (0..Self::SIP_D).for_each(|_| self.round());
        self.v0 ^ self.v1 ^ self.v2 ^ self.v3
    }
}
