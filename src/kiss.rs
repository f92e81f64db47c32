//! KISS framing, and a serial port speaking it.
//!
//! Each frame goes out as FEND, a command octet (port in the high nibble,
//! command in the low), the escaped frame, FEND.
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use anyhow::Result;
use log::debug;

const KISS_FEND: u8 = 0xC0;
const KISS_FESC: u8 = 0xDB;
const KISS_TFEND: u8 = 0xDC;
const KISS_TFESC: u8 = 0xDD;

const KISS_DATA: u8 = 0x00;

/// Something frames can be sent to and received from.
pub trait Kisser {
    fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for a frame.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;
}

/// KISS encode one data frame for `port`.
#[must_use]
pub fn escape(bytes: &[u8], port: u8) -> Vec<u8> {
    let mut ret = Vec::with_capacity(bytes.len() + 4);
    ret.push(KISS_FEND);
    ret.push((port << 4) | KISS_DATA);
    for &b in bytes {
        match b {
            KISS_FEND => ret.extend([KISS_FESC, KISS_TFEND]),
            KISS_FESC => ret.extend([KISS_FESC, KISS_TFESC]),
            b => ret.push(b),
        }
    }
    ret.push(KISS_FEND);
    ret
}

#[must_use]
fn find_frame(buf: &VecDeque<u8>) -> Option<(usize, usize)> {
    let start = buf.iter().position(|&b| b == KISS_FEND)?;
    let len = buf.iter().skip(start + 1).position(|&b| b == KISS_FEND)?;
    Some((start, start + 1 + len))
}

#[must_use]
fn unescape(data: &[u8]) -> Vec<u8> {
    let mut ret = Vec::with_capacity(data.len());
    let mut escaped = false;
    for &b in data {
        if escaped {
            ret.push(match b {
                KISS_TFEND => KISS_FEND,
                KISS_TFESC => KISS_FESC,
                b => b,
            });
            escaped = false;
        } else if b == KISS_FESC {
            escaped = true;
        } else {
            ret.push(b);
        }
    }
    ret
}

/// Turns a byte stream into frames.
#[derive(Debug, Default)]
pub struct KissDecoder {
    buf: VecDeque<u8>,
}

impl KissDecoder {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend(bytes);
    }

    /// Next complete data frame, if there is one.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        while let Some((a, b)) = find_frame(&self.buf) {
            let raw: Vec<u8> = self.buf.iter().skip(a + 1).take(b - a - 1).copied().collect();
            // Closing FEND doubles as the next opening one.
            self.buf.drain(..b);
            let Some((&cmd, body)) = raw.split_first() else {
                continue;
            };
            if cmd & 0x0F != KISS_DATA {
                debug!("Ignoring KISS command {cmd:#04x}");
                continue;
            }
            return Some(unescape(body));
        }
        None
    }
}

/// KISS TNC on a serial port.
pub struct Kiss {
    decoder: KissDecoder,
    port: Box<dyn serialport::SerialPort>,
}

impl Kiss {
    pub fn new(port: &str) -> Result<Self> {
        let port = serialport::new(port, 9600)
            .flow_control(serialport::FlowControl::None)
            .parity(serialport::Parity::None)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .open()?;
        port.clear(serialport::ClearBuffer::All)?;
        Ok(Self {
            decoder: KissDecoder::default(),
            port,
        })
    }
}

impl Kisser for Kiss {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        debug!("Sending frame {frame:02x?}");
        self.port.write_all(&escape(frame, 0))?;
        self.port.flush()?;
        Ok(())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let end = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return Ok(Some(frame));
            }
            let left = end.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(None);
            }
            self.port.set_timeout(left)?;
            let mut buf = [0u8; 256];
            match self.port.read(&mut buf) {
                Ok(n) => {
                    debug!("Got {n} bytes from serial");
                    self.decoder.push(&buf[..n]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Scripted AX.25 peer: UA for SABM and DISC, an I-frame back for every
/// I-frame.
#[cfg(test)]
#[derive(Default, Debug)]
pub(crate) struct FakeKiss {
    pub(crate) queue: VecDeque<Vec<u8>>,
    vs: u8,
}

#[cfg(test)]
impl Kisser for FakeKiss {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        use crate::frame::{Frame, Iframe, Ua};
        use crate::packet::Packet;
        use crate::seq::Modulus;

        let packet = Packet::parse(frame, Modulus::Normal)?;
        let reply = |command, frame| Packet {
            src: packet.dst.clone(),
            dst: packet.src.clone(),
            digipeater: vec![],
            command,
            dama: false,
            frame,
        };
        match &packet.frame {
            Frame::Sabm(p) => {
                let r = reply(false, Frame::Ua(Ua { poll: p.poll }));
                self.queue.push_back(r.serialize(Modulus::Normal));
            }
            Frame::Disc(p) => {
                let r = reply(false, Frame::Ua(Ua { poll: p.poll }));
                self.queue.push_back(r.serialize(Modulus::Normal));
            }
            Frame::Iframe(i) => {
                let r = reply(
                    true,
                    Frame::Iframe(Iframe {
                        ns: self.vs,
                        nr: Modulus::Normal.next(i.ns),
                        poll: false,
                        pid: Some(0xF0),
                        payload: vec![3, 2, 1],
                    }),
                );
                self.vs = Modulus::Normal.next(self.vs);
                self.queue.push_back(r.serialize(Modulus::Normal));
            }
            _ => {}
        }
        Ok(())
    }

    fn recv_timeout(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>> {
        Ok(self.queue.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping() {
        assert_eq!(escape(&[1, 2], 0), vec![0xC0, 0, 1, 2, 0xC0]);
        assert_eq!(
            escape(&[KISS_FEND, 5, KISS_FESC], 1),
            vec![0xC0, 0x10, 0xDB, 0xDC, 5, 0xDB, 0xDD, 0xC0]
        );
        assert_eq!(unescape(&[0xDB, 0xDC, 5, 0xDB, 0xDD]), vec![0xC0, 5, 0xDB]);
    }

    #[test]
    fn decode_stream() {
        let mut d = KissDecoder::default();
        assert_eq!(d.next_frame(), None);

        // Split across reads, with noise before the first FEND.
        let mut wire = vec![0x55, 0x66];
        wire.extend(escape(&[1, KISS_FEND, 3], 0));
        wire.extend(escape(&[4], 0));
        d.push(&wire[..5]);
        assert_eq!(d.next_frame(), None);
        d.push(&wire[5..]);
        assert_eq!(d.next_frame(), Some(vec![1, KISS_FEND, 3]));
        assert_eq!(d.next_frame(), Some(vec![4]));
        assert_eq!(d.next_frame(), None);
    }

    #[test]
    fn skips_non_data() {
        let mut d = KissDecoder::default();
        // TXDELAY, then an empty frame, then data.
        d.push(&[0xC0, 0x01, 0x20, 0xC0, 0xC0, 0xC0, 0x00, 9, 0xC0]);
        assert_eq!(d.next_frame(), Some(vec![9]));
        assert_eq!(d.next_frame(), None);
    }
}
