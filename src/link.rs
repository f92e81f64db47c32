//! Links, and the table they live in.
//!
//! A [`Link`] is one state machine with its LCB and the codec for its
//! flavour. It takes raw frames and local requests, and hands back
//! [`ReturnEvent`]s. Frames among those are turned into bytes with
//! [`Link::encode`].
//!
//! A [`LinkTable`] holds many links. Each one has its own lock, so frames for
//! one link are processed one at a time while different links don't wait
//! for each other.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Error, Result};
use log::{debug, info, warn};

use crate::addr::Addr;
use crate::config::{Config, Flavour};
use crate::lapb::{self, Role};
use crate::packet::Packet;
use crate::state::{self, Data, Event, LinkState, ReturnEvent, State};

pub struct Link {
    state: Box<dyn State>,
    data: Data,

    /// AX.25 only.
    me: Option<Addr>,
    peer: Option<Addr>,
    digipeaters: Vec<Addr>,

    /// Take the peer from whoever sends us a frame while Disconnected.
    listening: bool,
}

impl Link {
    /// AX.25 link with local address `me`. Until [`Link::set_peer`] is
    /// called, it listens for anyone.
    #[must_use]
    pub fn ax25(mut config: Config, me: Addr) -> Self {
        config.flavour = Flavour::Ax25;
        Self {
            state: state::new(),
            data: Data::new(config),
            me: Some(me),
            peer: None,
            digipeaters: vec![],
            listening: true,
        }
    }

    #[must_use]
    pub fn lapb(mut config: Config) -> Self {
        config.flavour = Flavour::Lapb;
        Self {
            state: state::new(),
            data: Data::new(config),
            me: None,
            peer: None,
            digipeaters: vec![],
            listening: false,
        }
    }

    /// Set the remote station and the digipeater path to it.
    pub fn set_peer(&mut self, peer: Addr, digipeaters: Vec<Addr>) {
        self.peer = Some(peer);
        self.digipeaters = digipeaters;
        self.listening = false;
    }

    #[must_use]
    pub fn peer(&self) -> Option<&Addr> {
        self.peer.as_ref()
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        self.state.kind()
    }

    #[must_use]
    pub fn data(&self) -> &Data {
        &self.data
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.is_state_connected()
    }

    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.state.is_state_disconnected()
    }

    fn role(&self) -> Role {
        Role {
            dce: self.data.config().dce,
            mlp: self.data.config().mlp,
        }
    }

    /// Feed the state machine any event.
    pub fn event(&mut self, event: Event) -> Vec<ReturnEvent> {
        let (next, ret) = state::handle(&*self.state, &mut self.data, event);
        if let Some(next) = next {
            self.state = next;
        }
        ret
    }

    /// Decode and dispatch one frame off the wire.
    ///
    /// Frames that don't decode, or aren't for this link, are logged and
    /// dropped.
    pub fn deliver_frame(&mut self, bytes: &[u8]) -> Vec<ReturnEvent> {
        let m = self.data.modulus();
        if !self.data.config().is_ax25() {
            return match lapb::decode(bytes, self.role(), m) {
                Ok((frame, command)) => self.event(Event::Frame {
                    frame,
                    command,
                    dama: false,
                }),
                Err(e) => {
                    warn!("Dropping undecodable LAPB frame: {e}");
                    vec![]
                }
            };
        }

        let packet = match Packet::parse(bytes, m) {
            Ok(p) => p,
            Err(e) => {
                warn!("Dropping undecodable AX.25 frame: {e}");
                return vec![];
            }
        };
        if !self.me.as_ref().is_some_and(|me| me.same(&packet.dst)) {
            debug!("Frame for {}, not us", packet.dst);
            return vec![];
        }
        let known = self.peer.as_ref().is_some_and(|p| p.same(&packet.src));
        if !known {
            if !self.listening || !self.state.is_state_disconnected() {
                debug!("Frame from {}, not our peer", packet.src);
                return vec![];
            }
            info!("Frame from new peer {}", packet.src);
            self.peer = Some(packet.src.clone());
            self.digipeaters = packet.reply_path();
        }
        self.event(Event::Frame {
            frame: packet.frame,
            command: packet.command,
            dama: packet.dama,
        })
    }

    /// Fire any expired timers.
    pub fn poll_timers(&mut self) -> Vec<ReturnEvent> {
        let mut ret = Vec::new();
        // Each expiry stops its timer, so this can't go on.
        for _ in 0..4 {
            let Some(ev) = self.data.expired_timer() else {
                break;
            };
            ret.extend(self.event(ev));
        }
        ret
    }

    #[must_use]
    pub fn next_timer_remaining(&self) -> Option<Duration> {
        self.data.next_timer_remaining()
    }

    /// Wire format of a frame event. None for events that aren't frames.
    pub fn encode(&self, ev: &ReturnEvent) -> Result<Option<Vec<u8>>> {
        let ReturnEvent::Frame(frame, command) = ev else {
            return Ok(None);
        };
        let m = self.data.modulus();
        if !self.data.config().is_ax25() {
            return Ok(Some(lapb::encode(frame, *command, self.role(), m)));
        }
        let (Some(me), Some(peer)) = (&self.me, &self.peer) else {
            return Err(Error::msg(format!(
                "no peer to send {} to",
                frame.name()
            )));
        };
        Ok(Some(
            Packet {
                src: me.clone(),
                dst: peer.clone(),
                digipeater: self.digipeaters.clone(),
                command: *command,
                dama: false,
                frame: frame.clone(),
            }
            .serialize(m),
        ))
    }
}

/// Handle for a link in a [`LinkTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkToken(u64);

impl std::fmt::Display for LinkToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LinkError {
    #[error("no such link: {0}")]
    BadToken(LinkToken),
}

/// Every link we know about.
#[derive(Default)]
pub struct LinkTable {
    links: Mutex<HashMap<LinkToken, Arc<Mutex<Link>>>>,
    next: AtomicU64,
}

// A panic while holding a link's lock leaves a link, not a broken table.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LinkTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, link: Link) -> LinkToken {
        let token = LinkToken(self.next.fetch_add(1, Ordering::Relaxed));
        lock(&self.links).insert(token, Arc::new(Mutex::new(link)));
        token
    }

    pub fn remove(&self, token: LinkToken) -> Result<(), LinkError> {
        lock(&self.links)
            .remove(&token)
            .map(|_| ())
            .ok_or(LinkError::BadToken(token))
    }

    /// The link behind a token. Lock it to use it.
    pub fn get(&self, token: LinkToken) -> Result<Arc<Mutex<Link>>, LinkError> {
        lock(&self.links)
            .get(&token)
            .cloned()
            .ok_or(LinkError::BadToken(token))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.links).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode one frame and run it through the link's state machine.
    pub fn deliver_frame(
        &self,
        token: LinkToken,
        bytes: &[u8],
    ) -> Result<Vec<ReturnEvent>, LinkError> {
        let link = self.get(token)?;
        let mut link = lock(&link);
        Ok(link.deliver_frame(bytes))
    }

    pub fn event(&self, token: LinkToken, event: Event) -> Result<Vec<ReturnEvent>, LinkError> {
        let link = self.get(token)?;
        let mut link = lock(&link);
        Ok(link.event(event))
    }

    /// Wire format of a frame event from the link behind `token`.
    pub fn encode(&self, token: LinkToken, ev: &ReturnEvent) -> Result<Option<Vec<u8>>> {
        let link = self.get(token)?;
        let link = lock(&link);
        link.encode(ev)
    }

    /// Fire expired timers on every link.
    pub fn poll_timers(&self) -> Vec<(LinkToken, Vec<ReturnEvent>)> {
        let links: Vec<_> = lock(&self.links)
            .iter()
            .map(|(t, l)| (*t, l.clone()))
            .collect();
        links
            .into_iter()
            .filter_map(|(token, link)| {
                let ev = lock(&link).poll_timers();
                (!ev.is_empty()).then_some((token, ev))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, Sabm};
    use crate::segment::PID_TEXT;
    use crate::state::{Cause, Delivery, Indication};

    /// Pass frames back and forth until both sides go quiet. Returns what
    /// each side told its upper layer.
    fn exchange(
        a: &mut Link,
        b: &mut Link,
        first: Vec<ReturnEvent>,
    ) -> Result<(Vec<ReturnEvent>, Vec<ReturnEvent>)> {
        let mut up_a = Vec::new();
        let mut up_b = Vec::new();
        let mut from_a = first;
        let mut from_b = Vec::new();
        for _ in 0..100 {
            if from_a.is_empty() && from_b.is_empty() {
                return Ok((up_a, up_b));
            }
            for ev in std::mem::take(&mut from_a) {
                match a.encode(&ev)? {
                    Some(bytes) => from_b.extend(b.deliver_frame(&bytes)),
                    None => up_a.push(ev),
                }
            }
            for ev in std::mem::take(&mut from_b) {
                match b.encode(&ev)? {
                    Some(bytes) => from_a.extend(a.deliver_frame(&bytes)),
                    None => up_b.push(ev),
                }
            }
        }
        Err(Error::msg("links never went quiet"))
    }

    fn text(payload: &[u8]) -> ReturnEvent {
        ReturnEvent::Data(Delivery::Raw {
            pid: Some(PID_TEXT),
            payload: payload.to_vec(),
        })
    }

    #[test]
    fn ax25_end_to_end() -> Result<()> {
        let mut a = Link::ax25(Config::ax25(), Addr::new("M0THC-1")?);
        a.set_peer(Addr::new("M0THC-2")?, vec![]);
        let mut b = Link::ax25(Config::ax25(), Addr::new("M0THC-2")?);

        let ev = a.event(Event::Connect(false));
        let (up_a, up_b) = exchange(&mut a, &mut b, ev)?;
        assert_eq!(
            up_a,
            vec![ReturnEvent::Indication(Indication::ConnectConfirmation(
                Cause::Ok
            ))]
        );
        assert_eq!(
            up_b,
            vec![ReturnEvent::Indication(Indication::ConnectIndication(
                Cause::Ok
            ))]
        );
        assert_eq!(a.state(), LinkState::DataTransfer);
        assert_eq!(b.state(), LinkState::DataTransfer);
        assert_eq!(b.peer().map(ToString::to_string), Some("M0THC-1".into()));

        let ev = a.event(Event::Data(None, b"hello".to_vec()));
        let (up_a, up_b) = exchange(&mut a, &mut b, ev)?;
        assert!(up_a.is_empty());
        assert_eq!(up_b, vec![text(b"hello")]);
        assert_eq!(a.data().unacked(), 1);

        // The reply carries the ack.
        let ev = b.event(Event::Data(None, b"world".to_vec()));
        let (up_b, up_a) = exchange(&mut b, &mut a, ev)?;
        assert!(up_b.is_empty());
        assert_eq!(up_a, vec![text(b"world")]);
        assert_eq!(a.data().unacked(), 0);
        assert_eq!(a.data().va(), 1);

        let ev = a.event(Event::Disconnect);
        let (up_a, up_b) = exchange(&mut a, &mut b, ev)?;
        assert_eq!(
            up_a,
            vec![ReturnEvent::Indication(
                Indication::DisconnectConfirmation(Cause::Ok)
            )]
        );
        assert_eq!(
            up_b,
            vec![ReturnEvent::Indication(Indication::DisconnectIndication(
                Cause::Ok
            ))]
        );
        assert!(a.is_disconnected());
        assert!(b.is_disconnected());

        // Free for someone else now.
        let mut c = Link::ax25(Config::ax25(), Addr::new("M0THC-3")?);
        c.set_peer(Addr::new("M0THC-2")?, vec![]);
        let ev = c.event(Event::Connect(false));
        exchange(&mut c, &mut b, ev)?;
        assert!(b.is_connected());
        assert_eq!(b.peer().map(ToString::to_string), Some("M0THC-3".into()));
        Ok(())
    }

    #[test]
    fn ax25_segmented_transfer() -> Result<()> {
        let mut c = Config::ax25().window(7);
        c.paclen = 32;
        let mut a = Link::ax25(c.clone(), Addr::new("M0THC-1")?);
        a.set_peer(Addr::new("M0THC-2")?, vec![]);
        let mut b = Link::ax25(c, Addr::new("M0THC-2")?);
        let ev = a.event(Event::Connect(false));
        exchange(&mut a, &mut b, ev)?;

        let payload: Vec<u8> = (0..100).collect();
        let ev = a.event(Event::Data(Some(0x01), payload.clone()));
        let (_, up_b) = exchange(&mut a, &mut b, ev)?;
        assert_eq!(
            up_b,
            vec![ReturnEvent::Data(Delivery::Raw {
                pid: Some(0x01),
                payload
            })]
        );
        Ok(())
    }

    #[test]
    fn lapb_end_to_end() -> Result<()> {
        let mut dte = Link::lapb(Config::lapb());
        let mut dce = Link::lapb(Config::lapb().dce(true).extended(true));
        // Mode mismatch: DCE only takes SABME.
        let ev = dte.event(Event::Connect(false));
        let (up, _) = exchange(&mut dte, &mut dce, ev)?;
        assert_eq!(
            up,
            vec![ReturnEvent::Indication(Indication::ConnectConfirmation(
                Cause::Refused
            ))]
        );

        let ev = dte.event(Event::Connect(true));
        exchange(&mut dte, &mut dce, ev)?;
        assert!(dte.is_connected());
        assert!(dce.is_connected());

        for i in 0..20u8 {
            let ev = dce.event(Event::Data(None, vec![i; 3]));
            let (_, up) = exchange(&mut dce, &mut dte, ev)?;
            assert_eq!(
                up,
                vec![ReturnEvent::Data(Delivery::Raw {
                    pid: None,
                    payload: vec![i; 3]
                })]
            );
            // Ack it, or the window closes.
            let ev = dte.event(Event::T2);
            exchange(&mut dte, &mut dce, ev)?;
        }
        assert_eq!(dce.data().unacked(), 0);
        assert_eq!(dte.data().vr(), 20);
        Ok(())
    }

    #[test]
    fn ax25_filters_addresses() -> Result<()> {
        let mut a = Link::ax25(Config::ax25(), Addr::new("M0THC-1")?);
        a.set_peer(Addr::new("M0THC-2")?, vec![]);
        let sabm = |src: &str, dst: &str| -> Result<Vec<u8>> {
            Ok(Packet {
                src: Addr::new(src)?,
                dst: Addr::new(dst)?,
                digipeater: vec![],
                command: true,
                dama: false,
                frame: Frame::Sabm(Sabm { poll: true }),
            }
            .serialize(crate::seq::Modulus::Normal))
        };
        assert!(a.deliver_frame(&sabm("M0THC-2", "M0THC-3")?).is_empty());
        assert!(a.deliver_frame(&sabm("M0THC-4", "M0THC-1")?).is_empty());
        assert!(a.deliver_frame(&[1, 2, 3]).is_empty());
        assert!(!a.deliver_frame(&sabm("M0THC-2", "M0THC-1")?).is_empty());
        assert!(a.is_connected());
        Ok(())
    }

    #[test]
    fn encode_needs_peer() -> Result<()> {
        let a = Link::ax25(Config::ax25(), Addr::new("M0THC-1")?);
        assert!(a
            .encode(&ReturnEvent::Frame(Frame::Sabm(Sabm { poll: true }), true))
            .is_err());
        assert_eq!(
            a.encode(&ReturnEvent::Indication(Indication::ConnectIndication(
                Cause::Ok
            )))?,
            None
        );
        Ok(())
    }

    #[test]
    fn table() -> Result<()> {
        let table = LinkTable::new();
        assert!(table.is_empty());
        let t = table.insert(Link::lapb(Config::lapb()));
        let t2 = table.insert(Link::lapb(Config::lapb().dce(true)));
        assert_ne!(t, t2);
        assert_eq!(table.len(), 2);

        let ev = table.event(t, Event::Connect(false))?;
        let bytes = table
            .encode(t, &ev[0])?
            .ok_or_else(|| Error::msg("no frame"))?;
        let ev = table.deliver_frame(t2, &bytes)?;
        assert_eq!(ev.len(), 2);
        assert!(table.poll_timers().is_empty());

        table.remove(t)?;
        assert_eq!(
            table.deliver_frame(t, &bytes),
            Err(LinkError::BadToken(t))
        );
        assert_eq!(table.remove(t), Err(LinkError::BadToken(t)));
        assert_eq!(
            LinkError::BadToken(t).to_string(),
            format!("no such link: {t}")
        );
        Ok(())
    }
}
