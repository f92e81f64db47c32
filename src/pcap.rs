//! pcap writer
//!
//! The pcap format is very simple, so no need for an external crate or linking
//! to libpcap.
//!
//! This implementation writes little endian pcap files on all platforms.
//!
//! Useful resources:
//! * https://wiki.wireshark.org/Development/LibpcapFileFormat
//! * https://www.ietf.org/archive/id/draft-gharris-opsawg-pcap-01.html
//! * https://www.tcpdump.org/linktypes.html

use std::io::BufWriter;
use std::io::Write;

use anyhow::Result;

use crate::config::Flavour;

// Little endian magic.
const MAGIC: [u8; 4] = [0xd4, 0xc3, 0xb2, 0xa1];
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;
const SNAPLEN: u32 = 65535;

const LINKTYPE_AX25: u32 = 3;
const LINKTYPE_LAPB_WITH_DIR: u32 = 207;

/// Which way a captured frame went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Received = 0,
    Sent = 1,
}

/// PcapWriter writes AX.25 or LAPB pcap files.
///
/// It writes them buffered, for efficiency, so a crash could lose the last
/// packets.
pub struct PcapWriter<W: Write = BufWriter<std::fs::File>> {
    f: W,
    flavour: Flavour,
}

impl PcapWriter {
    /// Create a new pcap file. Fails if the file already exists.
    pub fn create(filename: std::path::PathBuf, flavour: Flavour) -> Result<Self> {
        let f = BufWriter::new(
            std::fs::File::options()
                .read(false)
                .write(true)
                .create_new(true)
                .open(filename)?,
        );
        PcapWriter::new(f, flavour)
    }
}

impl<W: Write> PcapWriter<W> {
    /// Start a capture on any writer.
    pub fn new(mut f: W, flavour: Flavour) -> Result<Self> {
        f.write_all(&MAGIC)?;
        f.write_all(&VERSION_MAJOR.to_le_bytes())?;
        f.write_all(&VERSION_MINOR.to_le_bytes())?;

        // GMT offset, then timestamp accuracy. Everyone writes zero for both.
        f.write_all(&0u32.to_le_bytes())?;
        f.write_all(&0u32.to_le_bytes())?;

        f.write_all(&SNAPLEN.to_le_bytes())?;

        // Running without FCS, so no FCS bits here.
        let linktype = match flavour {
            Flavour::Ax25 => LINKTYPE_AX25,
            Flavour::Lapb => LINKTYPE_LAPB_WITH_DIR,
        };
        f.write_all(&linktype.to_le_bytes())?;
        Ok(Self { f, flavour })
    }

    /// Write a frame as a new packet entry.
    ///
    /// LAPB captures carry the direction. AX.25 has no room for it, but the
    /// addresses say it anyway.
    ///
    /// If this write fails, no further writes can be made, as the added record
    /// is now only partially added.
    pub fn write(&mut self, frame: &[u8], dir: Direction) -> Result<()> {
        let prefix: &[u8] = match self.flavour {
            Flavour::Ax25 => &[],
            Flavour::Lapb => &[dir as u8],
        };
        let len = (prefix.len() + frame.len()) as u32;
        let now = std::time::SystemTime::now().duration_since(std::time::SystemTime::UNIX_EPOCH)?;
        // TODO: The pcap format is not Y2036 safe. Move to pcapng for that.
        self.f.write_all(&(now.as_secs() as u32).to_le_bytes())?;
        self.f.write_all(&now.subsec_micros().to_le_bytes())?;
        self.f.write_all(&len.to_le_bytes())?;
        self.f.write_all(&len.to_le_bytes())?;
        self.f.write_all(prefix)?;
        self.f.write_all(frame)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.f.flush()?;
        Ok(())
    }

    /// Done writing, hand back the writer.
    pub fn into_inner(self) -> W {
        self.f
    }
}

/* vim: textwidth=80
 */
