//! LAPB framing: one address octet plus HDLC control and information.
//!
//! LAPB has no station addresses. The address octet only says which
//! direction a frame travels, and from that whether it's a command or a
//! response.
use anyhow::{Error, Result};

use crate::frame::Frame;
use crate::seq::Modulus;

// Single link.
pub const ADDR_A: u8 = 0x03;
pub const ADDR_B: u8 = 0x01;

// Multilink.
pub const ADDR_C: u8 = 0x0F;
pub const ADDR_D: u8 = 0x07;

/// Addressing role of the local end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Role {
    pub dce: bool,
    pub mlp: bool,
}

impl Role {
    /// Address octet for a frame we send.
    #[must_use]
    pub fn address(self, command: bool) -> u8 {
        match (self.mlp, self.dce, command) {
            (true, true, true) => ADDR_C,
            (true, true, false) => ADDR_D,
            (true, false, true) => ADDR_D,
            (true, false, false) => ADDR_C,
            (false, true, true) => ADDR_A,
            (false, true, false) => ADDR_B,
            (false, false, true) => ADDR_B,
            (false, false, false) => ADDR_A,
        }
    }

    /// Whether a received address octet marks a command. None if the octet
    /// isn't one the other end should be using.
    #[must_use]
    pub fn is_command(self, addr: u8) -> Option<bool> {
        // The peer has the opposite role, so what it sends as a command is
        // what we'd send as a response.
        let peer = Role {
            dce: !self.dce,
            mlp: self.mlp,
        };
        if addr == peer.address(true) {
            Some(true)
        } else if addr == peer.address(false) {
            Some(false)
        } else {
            None
        }
    }
}

#[must_use]
pub fn encode(frame: &Frame, command: bool, role: Role, m: Modulus) -> Vec<u8> {
    let mut ret = vec![role.address(command)];
    frame.encode(m, &mut ret);
    ret
}

/// Decode a LAPB frame, returning it with its command flag.
pub fn decode(bytes: &[u8], role: Role, m: Modulus) -> Result<(Frame, bool)> {
    if bytes.len() < 2 {
        return Err(Error::msg(format!(
            "LAPB frame too short: {} bytes",
            bytes.len()
        )));
    }
    let command = role
        .is_command(bytes[0])
        .ok_or_else(|| Error::msg(format!("bad LAPB address {:#04x}", bytes[0])))?;
    Ok((Frame::decode(&bytes[1..], m, false)?, command))
}
