//! AX.25 segmentation.
//!
//! Payloads longer than paclen are sent as a chain of I-frames with PID
//! [`PID_SEGMENT`]. Each segment starts with a count of the segments still
//! to come, with [`SEG_FIRST`] set on the first one. The first segment's
//! body begins with the PID of the payload being carried.
//!
//! Plain text (PID 0xF0) is instead just chopped up, since text doesn't
//! care where the frame boundaries are.
use anyhow::{Error, Result};
use log::{debug, warn};

pub const PID_SEGMENT: u8 = 0x08;
pub const PID_IP: u8 = 0xCC;
pub const PID_NETROM: u8 = 0xCF;
pub const PID_TEXT: u8 = 0xF0;

pub const SEG_FIRST: u8 = 0x80;
pub const SEG_REM: u8 = 0x7F;

/// Split `payload` into (PID, info) pairs no longer than `paclen`.
pub fn segment(pid: u8, payload: &[u8], paclen: usize) -> Result<Vec<(u8, Vec<u8>)>> {
    if payload.len() <= paclen {
        return Ok(vec![(pid, payload.to_vec())]);
    }
    if pid == PID_TEXT {
        return Ok(payload
            .chunks(paclen.max(1))
            .map(|c| (PID_TEXT, c.to_vec()))
            .collect());
    }

    // Two octets of every frame go to the segment PID and the count.
    let chunk = paclen.saturating_sub(2).max(1);
    let mut data = Vec::with_capacity(payload.len() + 1);
    data.push(pid);
    data.extend(payload);
    let count = data.len().div_ceil(chunk);
    if count - 1 > usize::from(SEG_REM) {
        return Err(Error::msg(format!(
            "{} octets is too long to segment with paclen {paclen}",
            payload.len()
        )));
    }
    Ok(data
        .chunks(chunk)
        .enumerate()
        .map(|(i, c)| {
            let mut rem = (count - 1 - i) as u8;
            if i == 0 {
                rem |= SEG_FIRST;
            }
            let mut info = Vec::with_capacity(c.len() + 1);
            info.push(rem);
            info.extend(c);
            (PID_SEGMENT, info)
        })
        .collect())
}

#[derive(Debug, PartialEq)]
pub enum Reassembly {
    /// Fragment stored, more to come.
    Consumed,

    /// Fragment (and whatever chain it was part of) thrown away.
    Dropped,

    /// Chain done. First octet is the PID.
    Complete(Vec<u8>),
}

/// Receive side fragment queue.
#[derive(Debug, Default)]
pub struct Reassembler {
    fragno: u8,
    fraglen: usize,
    queue: Vec<Vec<u8>>,
}

impl Reassembler {
    #[must_use]
    pub fn in_progress(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.fragno = 0;
        self.fraglen = 0;
        self.queue.clear();
    }

    /// Take one segment body, PID already stripped.
    pub fn push(&mut self, body: &[u8]) -> Reassembly {
        let Some((&seg, body)) = body.split_first() else {
            return Reassembly::Dropped;
        };
        let first = seg & SEG_FIRST != 0;
        let rem = seg & SEG_REM;

        if self.in_progress() {
            if !first && self.fragno.checked_sub(1) == Some(rem) {
                self.fragno = rem;
                self.fraglen += body.len();
                self.queue.push(body.to_vec());
                if rem == 0 {
                    return Reassembly::Complete(self.finish());
                }
                return Reassembly::Consumed;
            }
            warn!(
                "Fragment {rem} (first: {first}) out of sequence, expected {}. Dropping chain",
                self.fragno.saturating_sub(1)
            );
            self.clear();
            if !first {
                return Reassembly::Dropped;
            }
        }
        if !first {
            debug!("Fragment {rem} without a chain. Dropping");
            return Reassembly::Dropped;
        }
        if rem == 0 {
            return Reassembly::Complete(body.to_vec());
        }
        self.fragno = rem;
        self.fraglen = body.len();
        self.queue.push(body.to_vec());
        Reassembly::Consumed
    }

    fn finish(&mut self) -> Vec<u8> {
        let mut ret = Vec::with_capacity(self.fraglen);
        for f in self.queue.drain(..) {
            ret.extend(f);
        }
        self.clear();
        ret
    }
}
