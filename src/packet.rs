//! AX.25 frames: address header plus HDLC control and information fields.
use anyhow::{Error, Result};

use crate::addr::Addr;
use crate::frame::Frame;
use crate::seq::Modulus;

/// AX.25 allows at most 8 digipeaters.
pub const MAX_DIGIS: usize = 8;

const ADDR_LEN: usize = 7;

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub src: Addr,
    pub dst: Addr,
    pub digipeater: Vec<Addr>,

    /// Command, as opposed to response.
    pub command: bool,

    /// Sender is a DAMA master.
    pub dama: bool,

    pub frame: Frame,
}

impl Packet {
    #[must_use]
    pub fn serialize(&self, m: Modulus) -> Vec<u8> {
        let info_len = match &self.frame {
            Frame::Iframe(i) => i.payload.len() + 1,
            Frame::Ui(u) => u.payload.len() + 1,
            _ => 0,
        };
        let mut ret =
            Vec::with_capacity(ADDR_LEN * (2 + self.digipeater.len()) + 2 + info_len);
        ret.extend(self.dst.serialize(false, self.command, false, false));
        ret.extend(self.src.serialize(
            self.digipeater.is_empty(),
            !self.command,
            m.is_extended(),
            self.dama,
        ));
        let n = self.digipeater.len();
        for (i, digi) in self.digipeater.iter().enumerate() {
            ret.extend(digi.serialize(i + 1 == n, digi.highbit, false, false));
        }
        self.frame.encode(m, &mut ret);
        ret
    }

    pub fn parse(bytes: &[u8], m: Modulus) -> Result<Self> {
        if bytes.len() < 2 * ADDR_LEN + 1 {
            return Err(Error::msg(format!(
                "packet too short: {} bytes",
                bytes.len()
            )));
        }
        let dst = Addr::parse(&bytes[0..ADDR_LEN])?;
        let src = Addr::parse(&bytes[ADDR_LEN..2 * ADDR_LEN])?;
        let mut pos = 2 * ADDR_LEN;
        let mut digipeater = Vec::new();
        let mut last = src.lowbit;
        while !last {
            if digipeater.len() == MAX_DIGIS {
                return Err(Error::msg("too many digipeaters"));
            }
            let Some(field) = bytes.get(pos..pos + ADDR_LEN) else {
                return Err(Error::msg("address field truncated"));
            };
            let digi = Addr::parse(field)?;
            last = digi.lowbit;
            digipeater.push(digi);
            pos += ADDR_LEN;
        }
        let frame = Frame::decode(&bytes[pos..], m, true)?;

        // Version 1 frames have both or neither C bit set. Treat them as
        // commands.
        let command = !(src.highbit && !dst.highbit);
        Ok(Packet {
            command,
            dama: src.rbit_dama,
            src,
            dst,
            digipeater,
            frame,
        })
    }

    /// Digipeater path for replying to this packet.
    #[must_use]
    pub fn reply_path(&self) -> Vec<Addr> {
        self.digipeater
            .iter()
            .rev()
            .cloned()
            .map(|mut a| {
                a.highbit = false;
                a
            })
            .collect()
    }
}
