//! Blocking AX.25 connected mode client.
//!
//! One [`Client`] is one link over a KISS TNC. The same type serves both
//! ends: [`Client::connect`] dials out, [`Client::accept`] waits for a caller.
//!
//! # Examples
//!
//! ## Dialing out
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//! use hdlcarq::{Addr, Client, Kiss};
//!
//! let tnc = Kiss::new("/dev/rfcomm0")?;
//! let mut cli = Client::new(Addr::new("M0THC-1")?, Box::new(tnc));
//! cli.connect(&Addr::new("M0THC-2")?, false)?;
//! cli.write(b"Hello\r")?;
//! let stop = Arc::new(AtomicBool::new(false));
//! if let Some(reply) = cli.read_until(stop)? {
//!     println!("{}", String::from_utf8_lossy(&reply));
//! }
//! # Ok::<_, anyhow::Error>(())
//! ```
//!
//! ## Answering
//!
//! ```no_run
//! use std::time::{Duration, Instant};
//! use hdlcarq::{Addr, Client, Kiss};
//!
//! let tnc = Kiss::new("/dev/ttyS0")?;
//! let mut con = Client::new(Addr::new("M0THC-1")?, Box::new(tnc));
//! if !con.accept(Instant::now() + Duration::from_secs(600))? {
//!     anyhow::bail!("nobody called");
//! }
//! eprintln!("Call from {:?}", con.peer());
//! con.write(b"Welcome\r")?;
//! # Ok::<_, anyhow::Error>(())
//! ```
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Error, Result};
use log::{debug, error, info};

use crate::addr::Addr;
use crate::config::Config;
use crate::kiss::Kisser;
use crate::link::Link;
use crate::state::{Cause, Delivery, Event, Indication, LinkState, ReturnEvent};

/// How long to block on the transport when no timer is running.
const MAX_WAIT: Duration = Duration::from_millis(100);

/// One AX.25 link over a [`Kisser`].
///
/// Nothing happens on the link unless a method is running, so keep calling
/// `.read_until()`. Polls from the peer go unanswered and T1/T3 don't fire
/// in between.
#[must_use]
pub struct Client {
    kiss: Box<dyn Kisser>,
    link: Link,
    eof: bool,
    refused: Option<Cause>,
    incoming: VecDeque<u8>,
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            error!("Failed to send DISC for dropped client: {e}");
        }
    }
}

impl Client {
    /// Client for station `me`, with AX.25 defaults.
    pub fn new(me: Addr, kiss: Box<dyn Kisser>) -> Self {
        Self::with_config(Config::ax25(), me, kiss)
    }

    pub fn with_config(config: Config, me: Addr, kiss: Box<dyn Kisser>) -> Self {
        Self {
            kiss,
            link: Link::ax25(config, me),
            eof: false,
            refused: None,
            incoming: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        self.link.state()
    }

    #[must_use]
    pub fn peer(&self) -> Option<&Addr> {
        self.link.peer()
    }

    /// Dial `addr`, asking for modulus 128 if `ext`. Blocks until connected
    /// or refused, or until N2 retries went unanswered.
    pub fn connect(&mut self, addr: &Addr, ext: bool) -> Result<()> {
        self.link.set_peer(addr.clone(), vec![]);
        self.refused = None;
        self.actions(Event::Connect(ext))?;
        loop {
            self.step(Duration::from_secs(60))?;
            if self.link.is_connected() {
                debug!("Connected to {addr}");
                return Ok(());
            }
            if self.link.is_disconnected() {
                return Err(Error::msg(format!(
                    "connection failed: {:?}",
                    self.refused.unwrap_or(Cause::Timedout)
                )));
            }
        }
    }

    /// Wait for an incoming connection.
    ///
    /// Returns true once someone has connected to us, false if `until`
    /// passed first.
    pub fn accept(&mut self, until: Instant) -> Result<bool> {
        loop {
            if self.link.is_connected() {
                self.eof = false;
                return Ok(true);
            }
            let left = until.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(false);
            }
            self.step(left)?;
        }
    }

    /// Send DISC. Returns without waiting for the UA.
    pub fn disconnect(&mut self) -> Result<()> {
        if !self.link.is_disconnected() {
            self.actions(Event::Disconnect)?;
        }
        Ok(())
    }

    /// Queue data for the peer. Segmented if longer than paclen.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.actions(Event::Data(None, data.to_vec()))
    }

    /// The link went down, from either end.
    #[must_use]
    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Read data.
    ///
    /// Returns Some data, or None if the remote end disconnected or `done`
    /// got set.
    pub fn read_until(&mut self, done: Arc<AtomicBool>) -> Result<Option<Vec<u8>>> {
        while self.incoming.is_empty() {
            if self.eof || done.load(Ordering::SeqCst) {
                return Ok(None);
            }
            self.step(MAX_WAIT)?;
        }
        Ok(Some(self.incoming.drain(..).collect()))
    }

    /// Wait for one frame or timer, whichever is first, and act on it.
    fn step(&mut self, max_wait: Duration) -> Result<()> {
        let wait = self
            .link
            .next_timer_remaining()
            .map_or(max_wait, |t| t.min(max_wait));
        if let Some(frame) = self.kiss.recv_timeout(wait)? {
            let events = self.link.deliver_frame(&frame);
            self.process(events)?;
        }
        let events = self.link.poll_timers();
        self.process(events)
    }

    /// Give the state machine a local event.
    fn actions(&mut self, event: Event) -> Result<()> {
        let events = self.link.event(event);
        self.process(events)
    }

    /// Act on what the state machine said: send frames, keep data.
    fn process(&mut self, events: Vec<ReturnEvent>) -> Result<()> {
        for ev in events {
            match &ev {
                ReturnEvent::Indication(i) => {
                    info!("{i:?}");
                    match i {
                        Indication::ConnectConfirmation(c) if *c != Cause::Ok => {
                            self.refused = Some(*c);
                        }
                        Indication::DisconnectIndication(_)
                        | Indication::DisconnectConfirmation(_) => self.eof = true,
                        _ => {}
                    }
                }
                ReturnEvent::Data(Delivery::Raw { payload, .. }) => {
                    self.incoming.extend(payload);
                }
                ReturnEvent::Data(d) => debug!("Not for us: {d:?}"),
                ReturnEvent::Frame(..) => {}
            }
            if let Some(bytes) = self.link.encode(&ev)? {
                self.kiss.send(&bytes)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, Sabm};
    use crate::kiss::FakeKiss;
    use crate::packet::Packet;
    use crate::seq::Modulus;

    fn sabm(src: &str, dst: &str) -> Result<Vec<u8>> {
        Ok(Packet {
            src: Addr::new(src)?,
            dst: Addr::new(dst)?,
            digipeater: vec![],
            command: true,
            dama: false,
            frame: Frame::Sabm(Sabm { poll: true }),
        }
        .serialize(Modulus::Normal))
    }

    #[test]
    fn client() -> Result<()> {
        let k = FakeKiss::default();
        let mut c = Client::new(Addr::new("M0THC-1")?, Box::new(k));
        c.connect(&Addr::new("M0THC-2")?, false)?;
        assert_eq!(c.state(), LinkState::DataTransfer);
        c.write(&[1, 2, 3])?;
        let done = Arc::new(AtomicBool::new(false));
        assert_eq!(c.read_until(done)?, Some(vec![3, 2, 1]));
        assert_eq!(c.link.data().unacked(), 0);
        c.disconnect()?;
        assert_eq!(c.state(), LinkState::AwaitingRelease);
        Ok(())
    }

    #[test]
    fn read_until_done() -> Result<()> {
        let mut c = Client::new(Addr::new("M0THC-1")?, Box::new(FakeKiss::default()));
        c.connect(&Addr::new("M0THC-2")?, false)?;
        let done = Arc::new(AtomicBool::new(true));
        assert_eq!(c.read_until(done)?, None);
        Ok(())
    }

    #[test]
    fn listen_timeout() -> Result<()> {
        let k = FakeKiss::default();
        let mut c = Client::new(Addr::new("M0THC-2")?, Box::new(k));
        assert!(!c.accept(Instant::now() + Duration::from_millis(1))?);
        Ok(())
    }

    #[test]
    fn listen_wrong_dst() -> Result<()> {
        let mut k = FakeKiss::default();
        k.queue.push_back(sabm("M0THC-1", "M0THC-3")?);
        let mut c = Client::new(Addr::new("M0THC-2")?, Box::new(k));
        assert!(!c.accept(Instant::now() + Duration::from_millis(1))?);
        Ok(())
    }

    #[test]
    fn listen() -> Result<()> {
        let mut k = FakeKiss::default();
        k.queue.push_back(sabm("M0THC-1", "M0THC-2")?);
        let mut c = Client::new(Addr::new("M0THC-2")?, Box::new(k));
        assert!(c.accept(Instant::now() + Duration::from_millis(100))?);
        assert_eq!(c.peer().map(ToString::to_string), Some("M0THC-1".into()));
        Ok(())
    }
}
