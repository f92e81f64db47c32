//! HDLC frames, as seen by the state machine.
//!
//! This is the part of a frame that AX.25 and LAPB have in common: the
//! control field and the information field. Addressing is done by
//! [`crate::packet`] and [`crate::lapb`].
use anyhow::{Error, Result};

use crate::seq::Modulus;

// Unnumbered frames. Ending in 11.
#[allow(clippy::unusual_byte_groupings)]
pub const CONTROL_SABM: u8 = 0b001_0_11_11;
#[allow(clippy::unusual_byte_groupings)]
pub const CONTROL_SABME: u8 = 0b011_0_11_11;
#[allow(clippy::unusual_byte_groupings)]
pub const CONTROL_UI: u8 = 0b000_0_00_11;
#[allow(clippy::unusual_byte_groupings)]
pub const CONTROL_DISC: u8 = 0b010_0_00_11;
pub const CONTROL_DM: u8 = 0b0000_1111;
pub const CONTROL_UA: u8 = 0b0110_0011;
pub const CONTROL_FRMR: u8 = 0b1000_0111;

// Supervisory frames. Ending in 01.
pub const CONTROL_RR: u8 = 0b0000_0001;
pub const CONTROL_RNR: u8 = 0b0000_0101;
pub const CONTROL_REJ: u8 = 0b0000_1001;

// Iframes end in 0.
pub const CONTROL_IFRAME: u8 = 0b0000_0000;

// Masks.
pub const CONTROL_POLL: u8 = 0b0001_0000;
pub const EXT_POLL: u8 = 0b0000_0001;
pub const NR_MASK: u8 = 0b1110_0000;
pub const TYPE_MASK: u8 = 0b0000_0011;
pub const S_MASK: u8 = 0b0000_1111;

/// SABM - Set Asynchronous Balanced Mode.
#[derive(Clone, Debug, PartialEq)]
pub struct Sabm {
    pub poll: bool,
}

/// SABME - Set Asynchronous Balanced Mode Extended. Modulus 128.
#[derive(Clone, Debug, PartialEq)]
pub struct Sabme {
    pub poll: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Disc {
    pub poll: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Ua {
    pub poll: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Dm {
    pub poll: bool,
}

/// Frame reject. The information field says why, but nobody acts on it.
#[derive(Clone, Debug, PartialEq)]
pub struct Frmr {
    pub poll: bool,
    pub info: Vec<u8>,
}

/// Unnumbered information. Connectionless, not sequenced.
#[derive(Clone, Debug, PartialEq)]
pub struct Ui {
    pub push: bool,
    pub pid: Option<u8>,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Rr {
    pub poll: bool,
    pub nr: u8,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Rnr {
    pub poll: bool,
    pub nr: u8,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Rej {
    pub poll: bool,
    pub nr: u8,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Iframe {
    pub nr: u8,
    pub ns: u8,
    pub poll: bool,

    /// AX.25 only.
    pub pid: Option<u8>,
    pub payload: Vec<u8>,
}

/// Anything we can't make sense of. Handed to the state machine anyway,
/// since it's a reason to reset the link.
#[derive(Clone, Debug, PartialEq)]
pub struct Illegal {
    pub control: u8,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Sabm(Sabm),
    Sabme(Sabme),
    Disc(Disc),
    Ua(Ua),
    Dm(Dm),
    Frmr(Frmr),
    Ui(Ui),
    Rr(Rr),
    Rnr(Rnr),
    Rej(Rej),
    Iframe(Iframe),
    Illegal(Illegal),
}

fn poll_bit(poll: bool) -> u8 {
    if poll {
        CONTROL_POLL
    } else {
        0
    }
}

impl Frame {
    /// Poll (or final) bit.
    #[must_use]
    pub fn poll(&self) -> bool {
        match self {
            Frame::Sabm(f) => f.poll,
            Frame::Sabme(f) => f.poll,
            Frame::Disc(f) => f.poll,
            Frame::Ua(f) => f.poll,
            Frame::Dm(f) => f.poll,
            Frame::Frmr(f) => f.poll,
            Frame::Ui(f) => f.push,
            Frame::Rr(f) => f.poll,
            Frame::Rnr(f) => f.poll,
            Frame::Rej(f) => f.poll,
            Frame::Iframe(f) => f.poll,
            Frame::Illegal(_) => false,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Sabm(_) => "SABM",
            Frame::Sabme(_) => "SABME",
            Frame::Disc(_) => "DISC",
            Frame::Ua(_) => "UA",
            Frame::Dm(_) => "DM",
            Frame::Frmr(_) => "FRMR",
            Frame::Ui(_) => "UI",
            Frame::Rr(_) => "RR",
            Frame::Rnr(_) => "RNR",
            Frame::Rej(_) => "REJ",
            Frame::Iframe(_) => "I",
            Frame::Illegal(_) => "illegal",
        }
    }

    /// Append control and information fields.
    pub fn encode(&self, m: Modulus, out: &mut Vec<u8>) {
        let sup = |out: &mut Vec<u8>, ctl: u8, nr: u8, poll: bool| {
            if m.is_extended() {
                out.push(ctl);
                out.push(((nr << 1) & 0xFE) | if poll { EXT_POLL } else { 0 });
            } else {
                out.push(ctl | poll_bit(poll) | ((nr << 5) & NR_MASK));
            }
        };
        match self {
            Frame::Sabm(f) => out.push(CONTROL_SABM | poll_bit(f.poll)),
            Frame::Sabme(f) => out.push(CONTROL_SABME | poll_bit(f.poll)),
            Frame::Disc(f) => out.push(CONTROL_DISC | poll_bit(f.poll)),
            Frame::Ua(f) => out.push(CONTROL_UA | poll_bit(f.poll)),
            Frame::Dm(f) => out.push(CONTROL_DM | poll_bit(f.poll)),
            Frame::Frmr(f) => {
                out.push(CONTROL_FRMR | poll_bit(f.poll));
                out.extend(&f.info);
            }
            Frame::Ui(f) => {
                out.push(CONTROL_UI | poll_bit(f.push));
                out.extend(f.pid);
                out.extend(&f.payload);
            }
            Frame::Rr(f) => sup(out, CONTROL_RR, f.nr, f.poll),
            Frame::Rnr(f) => sup(out, CONTROL_RNR, f.nr, f.poll),
            Frame::Rej(f) => sup(out, CONTROL_REJ, f.nr, f.poll),
            Frame::Iframe(f) => {
                if m.is_extended() {
                    out.push((f.ns << 1) & 0xFE);
                    out.push(((f.nr << 1) & 0xFE) | if f.poll { EXT_POLL } else { 0 });
                } else {
                    out.push(
                        CONTROL_IFRAME
                            | poll_bit(f.poll)
                            | ((f.nr << 5) & NR_MASK)
                            | ((f.ns << 1) & 0b0000_1110),
                    );
                }
                out.extend(f.pid);
                out.extend(&f.payload);
            }
            Frame::Illegal(f) => out.push(f.control),
        }
    }

    /// Decode control and information fields.
    ///
    /// Only an empty buffer is an error. Everything else that doesn't parse
    /// comes back as [`Frame::Illegal`].
    pub fn decode(bytes: &[u8], m: Modulus, has_pid: bool) -> Result<Self> {
        let Some(&control) = bytes.first() else {
            return Err(Error::msg("frame has no control field"));
        };
        let illegal = Frame::Illegal(Illegal { control });

        // Numbered frames: (N(S), N(R), P/F, rest).
        let numbered = |bytes: &[u8]| -> Option<(u8, u8, bool, Vec<u8>)> {
            if m.is_extended() {
                let second = *bytes.get(1)?;
                Some((
                    (control >> 1) & 0x7F,
                    (second >> 1) & 0x7F,
                    second & EXT_POLL != 0,
                    bytes[2..].to_vec(),
                ))
            } else {
                Some((
                    (control >> 1) & 7,
                    (control >> 5) & 7,
                    control & CONTROL_POLL != 0,
                    bytes[1..].to_vec(),
                ))
            }
        };
        let split_pid = |rest: Vec<u8>| -> Option<(Option<u8>, Vec<u8>)> {
            if !has_pid {
                return Some((None, rest));
            }
            let (&pid, payload) = rest.split_first()?;
            Some((Some(pid), payload.to_vec()))
        };

        Ok(match control & TYPE_MASK {
            0 | 2 => {
                let Some((ns, nr, poll, rest)) = numbered(bytes) else {
                    return Ok(illegal);
                };
                let Some((pid, payload)) = split_pid(rest) else {
                    return Ok(illegal);
                };
                Frame::Iframe(Iframe {
                    ns,
                    nr,
                    poll,
                    pid,
                    payload,
                })
            }
            1 => {
                let Some((_, nr, poll, _)) = numbered(bytes) else {
                    return Ok(illegal);
                };
                match control & S_MASK {
                    CONTROL_RR => Frame::Rr(Rr { nr, poll }),
                    CONTROL_RNR => Frame::Rnr(Rnr { nr, poll }),
                    CONTROL_REJ => Frame::Rej(Rej { nr, poll }),
                    // SREJ, and whatever else.
                    _ => illegal,
                }
            }
            _ => {
                let poll = control & CONTROL_POLL != 0;
                let rest = &bytes[1..];
                match control & !CONTROL_POLL {
                    CONTROL_SABM => Frame::Sabm(Sabm { poll }),
                    CONTROL_SABME => Frame::Sabme(Sabme { poll }),
                    CONTROL_DISC => Frame::Disc(Disc { poll }),
                    CONTROL_UA => Frame::Ua(Ua { poll }),
                    CONTROL_DM => Frame::Dm(Dm { poll }),
                    CONTROL_FRMR => Frame::Frmr(Frmr {
                        poll,
                        info: rest.to_vec(),
                    }),
                    CONTROL_UI => {
                        let Some((pid, payload)) = split_pid(rest.to_vec()) else {
                            return Ok(illegal);
                        };
                        Frame::Ui(Ui {
                            push: poll,
                            pid,
                            payload,
                        })
                    }
                    _ => illegal,
                }
            }
        })
    }
}
