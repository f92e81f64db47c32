//! Per-link parameters.
use std::time::Duration;

/// Which of the two HDLC dialects a link speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavour {
    /// AX.25 connected mode. Callsign addressing, PIDs, segmentation, DAMA.
    Ax25,

    /// X.25 LAPB. Single octet addressing, no PID.
    Lapb,
}

/// T1 backoff on retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    Linear,
    Exponential,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub flavour: Flavour,

    /// Ask for modulus 128 (SABME) when initiating. For LAPB this also
    /// decides which of SABM/SABME we accept.
    pub extended: bool,

    /// LAPB: act as DCE rather than DTE. Changes addressing only.
    pub dce: bool,

    /// LAPB: multilink addressing (C/D instead of A/B).
    pub mlp: bool,

    pub t1: Duration,
    pub t2: Duration,

    /// Keepalive. None disables it.
    pub t3: Option<Duration>,

    /// Disconnect after this long without I-frames. None disables it.
    pub idle: Option<Duration>,

    /// Max retries.
    pub n2: u32,

    /// Max outstanding I-frames, modulus 8.
    pub window: u8,

    /// Max outstanding I-frames, modulus 128.
    pub ewindow: u8,

    /// Max info field octets per I-frame sent. Received frames longer than
    /// this (plus PID) are protocol violations.
    pub paclen: usize,

    pub backoff: Backoff,

    /// Answer SABM/SABME while disconnected.
    pub accept_incoming: bool,

    /// Deliver PID 0xCC frames as IP.
    pub ip: bool,

    /// Deliver PID 0xCF frames to NET/ROM.
    pub netrom: bool,

    /// Raw socket PID filter. None accepts every PID.
    pub socket_pid: Option<u8>,

    /// PID used for outgoing data that doesn't name one.
    pub default_pid: u8,
}

impl Config {
    #[must_use]
    pub fn ax25() -> Self {
        Self {
            flavour: Flavour::Ax25,
            extended: false,
            dce: false,
            mlp: false,
            t1: Duration::from_secs(10),
            t2: Duration::from_secs(3),
            t3: Some(Duration::from_secs(300)),
            idle: None,
            n2: 10,
            window: 2,
            ewindow: 32,
            paclen: 256,
            backoff: Backoff::Linear,
            accept_incoming: true,
            ip: true,
            netrom: true,
            socket_pid: None,
            default_pid: crate::segment::PID_TEXT,
        }
    }

    #[must_use]
    pub fn lapb() -> Self {
        Self {
            flavour: Flavour::Lapb,
            extended: false,
            dce: false,
            mlp: false,
            t1: Duration::from_secs(5),
            t2: Duration::from_secs(1),
            t3: None,
            idle: None,
            n2: 20,
            window: 7,
            ewindow: 7,
            paclen: 4096,
            backoff: Backoff::None,
            accept_incoming: true,
            ip: false,
            netrom: false,
            socket_pid: None,
            default_pid: crate::segment::PID_TEXT,
        }
    }

    #[must_use]
    pub fn extended(mut self, ext: bool) -> Self {
        self.extended = ext;
        self
    }

    #[must_use]
    pub fn dce(mut self, dce: bool) -> Self {
        self.dce = dce;
        self
    }

    #[must_use]
    pub fn t1(mut self, v: Duration) -> Self {
        self.t1 = v;
        self
    }

    #[must_use]
    pub fn n2(mut self, n: u32) -> Self {
        self.n2 = n;
        self
    }

    #[must_use]
    pub fn window(mut self, w: u8) -> Self {
        self.window = w;
        self
    }

    #[must_use]
    pub fn is_ax25(&self) -> bool {
        self.flavour == Flavour::Ax25
    }

    /// Window to use for the given modulus, clamped so that the window
    /// can never wrap onto V(A).
    #[must_use]
    pub fn window_for(&self, m: crate::seq::Modulus) -> u8 {
        let w = if m.is_extended() {
            self.ewindow
        } else {
            self.window
        };
        w.clamp(1, m.value() - 1)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::ax25()
    }
}
