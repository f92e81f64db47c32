//! AX.25 station addresses.
use anyhow::{Error, Result};

/// Source, destination, or digipeater address.
///
/// The flag bits are only meaningful on addresses that came off the air;
/// when serializing, the caller decides them.
#[derive(Debug, Clone, PartialEq)]
pub struct Addr {
    call: String,
    ssid: u8,

    /// Address extension bit. Set on the last address of the header.
    pub(crate) lowbit: bool,

    /// C bit for src/dst, H (has-been-repeated) bit for digipeaters.
    pub(crate) highbit: bool,

    /// Reserved bit 0x40 cleared.
    pub(crate) rbit_ext: bool,

    /// Reserved bit 0x20 cleared. On the source address this marks a DAMA
    /// master.
    pub(crate) rbit_dama: bool,
}

const EXTENSION_BIT: u8 = 0b0000_0001;
const HIGH_BIT: u8 = 0b1000_0000;
const RBIT_EXT: u8 = 0b0100_0000;
const RBIT_DAMA: u8 = 0b0010_0000;

impl Addr {
    /// Parse `CALL` or `CALL-SSID`.
    pub fn new(s: &str) -> Result<Self> {
        let s = s.to_uppercase();
        let re = regex::Regex::new(r"^([A-Z0-9]{1,6})(?:-([0-9]|1[0-5]))?$")
            .expect("can't happen: Regex compile fail");
        let caps = re
            .captures(&s)
            .ok_or_else(|| Error::msg(format!("invalid callsign: {s}")))?;
        let ssid = match caps.get(2) {
            Some(m) => m.as_str().parse::<u8>()?,
            None => 0,
        };
        Ok(Self {
            call: caps[1].to_string(),
            ssid,
            lowbit: false,
            highbit: false,
            rbit_ext: false,
            rbit_dama: false,
        })
    }

    #[must_use]
    pub fn call(&self) -> &str {
        &self.call
    }

    #[must_use]
    pub fn ssid(&self) -> u8 {
        self.ssid
    }

    /// Same station, ignoring flag bits.
    #[must_use]
    pub fn same(&self, other: &Addr) -> bool {
        self.call == other.call && self.ssid == other.ssid
    }

    /// Parse one 7 octet address field.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 7 {
            return Err(Error::msg(format!(
                "invalid serialized callsign: {bytes:?}"
            )));
        }
        let call = bytes
            .iter()
            .take(6)
            .map(|&c| (c >> 1) as char)
            .collect::<String>()
            .trim_end()
            .to_string();
        if call.is_empty() || !call.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::msg(format!("invalid serialized callsign: {call:?}")));
        }
        let last = bytes[6];
        Ok(Self {
            call,
            ssid: (last >> 1) & 15,
            lowbit: last & EXTENSION_BIT != 0,
            highbit: last & HIGH_BIT != 0,
            rbit_ext: last & RBIT_EXT == 0,
            rbit_dama: last & RBIT_DAMA == 0,
        })
    }

    /// Serialize to a 7 octet address field.
    #[must_use]
    pub fn serialize(
        &self,
        lowbit: bool,
        highbit: bool,
        rbit_ext: bool,
        rbit_dama: bool,
    ) -> [u8; 7] {
        let mut ret = [b' ' << 1; 7];
        for (i, ch) in self.call.bytes().take(6).enumerate() {
            ret[i] = ch << 1;
        }
        ret[6] = ((self.ssid & 15) << 1)
            | (if rbit_ext { 0 } else { RBIT_EXT })
            | (if rbit_dama { 0 } else { RBIT_DAMA })
            | (if lowbit { EXTENSION_BIT } else { 0 })
            | (if highbit { HIGH_BIT } else { 0 });
        ret
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.ssid > 0 {
            write!(f, "{}-{}", self.call, self.ssid)
        } else {
            write!(f, "{}", self.call)
        }
    }
}
