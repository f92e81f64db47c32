//! Sequence number arithmetic.
//!
//! V(S), V(R), V(A), N(S) and N(R) all live on a circle of either 8 or 128
//! values. Everything comparing them has to go through here.

/// Sequence numbering modulus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modulus {
    /// Basic mode, three bit sequence numbers. SABM.
    Normal = 8,

    /// Extended mode, seven bit sequence numbers. SABME.
    Extended = 128,
}

impl Modulus {
    #[must_use]
    pub fn from_extended(ext: bool) -> Self {
        if ext {
            Modulus::Extended
        } else {
            Modulus::Normal
        }
    }

    #[must_use]
    pub fn is_extended(self) -> bool {
        self == Modulus::Extended
    }

    #[must_use]
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Sequence number following `seq`.
    #[must_use]
    pub fn next(self, seq: u8) -> u8 {
        ((u16::from(seq) + 1) % u16::from(self.value())) as u8
    }

    /// Add `n` to `seq`.
    #[must_use]
    pub fn add(self, seq: u8, n: u8) -> u8 {
        ((u16::from(seq) + u16::from(n)) % u16::from(self.value())) as u8
    }

    /// Sequence number preceding `seq`.
    #[must_use]
    pub fn prev(self, seq: u8) -> u8 {
        self.sub(seq, 1)
    }

    /// Circular distance from `b` forward to `a`.
    #[must_use]
    pub fn sub(self, a: u8, b: u8) -> u8 {
        let m = u16::from(self.value());
        ((u16::from(a) + m - (u16::from(b) % m)) % m) as u8
    }

    /// True if `nr` is in `[va, vs]`, walking forward from `va`.
    ///
    /// This is the N(R) validity check: a peer may acknowledge anything from
    /// the oldest outstanding frame up to and including the next one we'd
    /// send, and nothing else.
    #[must_use]
    pub fn in_window(self, va: u8, nr: u8, vs: u8) -> bool {
        if nr >= self.value() {
            return false;
        }
        self.sub(nr, va) <= self.sub(vs, va)
    }
}
