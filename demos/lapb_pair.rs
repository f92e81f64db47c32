//! Two LAPB links, DTE and DCE, talking to each other in-process.
use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Error, Result};
use clap::Parser;

use hdlcarq::pcap::{Direction, PcapWriter};
use hdlcarq::{Config, Event, Flavour, Link, LinkTable, LinkToken, ReturnEvent};

#[derive(Parser, Debug)]
struct Opt {
    /// Use modulus 128.
    #[clap(short = 'e')]
    ext: bool,

    /// Messages to send from DTE to DCE.
    #[clap(short = 'n', default_value = "20")]
    count: usize,

    #[clap(short = 'v', default_value = "0")]
    v: usize,

    #[clap(long)]
    capture: Option<std::path::PathBuf>,
}

struct Wire {
    table: LinkTable,
    dte: LinkToken,
    dce: LinkToken,
    queue: VecDeque<(LinkToken, Vec<u8>)>,
    capture: Option<PcapWriter>,
}

impl Wire {
    fn name(&self, token: LinkToken) -> &'static str {
        if token == self.dte {
            "DTE"
        } else {
            "DCE"
        }
    }

    /// Put frames on the wire, print everything else.
    fn route(&mut self, from: LinkToken, events: Vec<ReturnEvent>) -> Result<()> {
        let to = if from == self.dte { self.dce } else { self.dte };
        for ev in events {
            match self.table.encode(from, &ev)? {
                Some(bytes) => {
                    if let Some(c) = &mut self.capture {
                        // Captured from the DTE's point of view.
                        let dir = if from == self.dte {
                            Direction::Sent
                        } else {
                            Direction::Received
                        };
                        c.write(&bytes, dir)?;
                    }
                    self.queue.push_back((to, bytes));
                }
                None => println!("{}: {ev:?}", self.name(from)),
            }
        }
        Ok(())
    }

    /// Deliver frames until the wire is quiet.
    fn pump(&mut self) -> Result<()> {
        while let Some((to, bytes)) = self.queue.pop_front() {
            let ev = self.table.deliver_frame(to, &bytes)?;
            self.route(to, ev)?;
        }
        Ok(())
    }

    fn event(&mut self, token: LinkToken, event: Event) -> Result<()> {
        let ev = self.table.event(token, event)?;
        self.route(token, ev)?;
        self.pump()
    }

    /// Run timers until `done` says stop.
    fn wait(&mut self, done: impl Fn(&Link) -> bool, token: LinkToken) -> Result<()> {
        for _ in 0..200 {
            {
                let link = self.table.get(token)?;
                let link = link.lock().map_err(|e| Error::msg(e.to_string()))?;
                if done(&link) {
                    return Ok(());
                }
            }
            std::thread::sleep(Duration::from_millis(50));
            for (token, ev) in self.table.poll_timers() {
                self.route(token, ev)?;
            }
            self.pump()?;
        }
        Err(Error::msg("gave up waiting"))
    }
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module("hdlcarq")
        .verbosity(opt.v)
        .init()?;

    let table = LinkTable::new();
    let dte = table.insert(Link::lapb(Config::lapb().extended(opt.ext)));
    let dce = table.insert(Link::lapb(Config::lapb().extended(opt.ext).dce(true)));
    let capture = match opt.capture {
        Some(path) => Some(PcapWriter::create(path, Flavour::Lapb)?),
        None => None,
    };
    let mut wire = Wire {
        table,
        dte,
        dce,
        queue: VecDeque::new(),
        capture,
    };

    wire.event(dte, Event::Connect(opt.ext))?;
    wire.wait(Link::is_connected, dte)?;

    for i in 0..opt.count {
        wire.event(dte, Event::Data(None, format!("message {i}").into_bytes()))?;
    }
    // The DCE acks the tail end when its T2 runs out.
    wire.wait(|l| l.data().unacked() == 0 && l.data().queued() == 0, dte)?;

    wire.event(dte, Event::Disconnect)?;
    wire.wait(Link::is_disconnected, dte)?;
    wire.wait(Link::is_disconnected, dce)?;

    if let Some(c) = &mut wire.capture {
        c.flush()?;
    }
    Ok(())
}
