//! The link state machine.
//!
//! One [`State`] implementation per state, one method per incoming frame
//! type or local event. Handlers mutate the Link Control Block ([`Data`])
//! and return a list of [`Action`]s. [`handle`] turns those into
//! [`ReturnEvent`]s for the caller, then runs the transmit path and
//! re-derives every timer from the resulting state.
//!
//! Handlers never start timers. They may stop one, which makes the exit
//! step start it afresh.
use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::Config;
use crate::frame::{
    Disc, Dm, Frame, Frmr, Iframe, Illegal, Rej, Rnr, Rr, Sabm, Sabme, Ua, Ui,
};
use crate::segment::Reassembler;
use crate::seq::Modulus;
use crate::timer::Timer;

/// The five link states. The numbers are the traditional ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected = 0,
    AwaitingConnection = 1,
    AwaitingRelease = 2,
    DataTransfer = 3,
    TimerRecovery = 4,
}

/// Input to the state machine.
#[derive(Debug, PartialEq)]
pub enum Event {
    /// DL-CONNECT request. True asks for modulus 128.
    Connect(bool),

    /// DL-DISCONNECT request.
    Disconnect,

    /// DL-DATA request. AX.25 uses the PID, or the configured default if
    /// None. LAPB ignores it.
    Data(Option<u8>, Vec<u8>),

    /// Upper layer can't (true) or can again (false) take more data.
    Busy(bool),

    /// A frame from the peer.
    Frame {
        frame: Frame,
        command: bool,
        dama: bool,
    },

    T1,
    T2,
    T3,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    Ok,
    Refused,
    NotConnected,
    Reset,
    Timedout,
}

/// Upper layer lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indication {
    /// Peer connected to us.
    ConnectIndication(Cause),

    /// Our connect attempt finished.
    ConnectConfirmation(Cause),

    /// Peer (or the link) ended the connection.
    DisconnectIndication(Cause),

    /// Our disconnect attempt finished.
    DisconnectConfirmation(Cause),
}

/// Data for the upper layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Ip(Vec<u8>),
    NetRom(Vec<u8>),

    /// Anything else, for whoever is reading the link. LAPB has no PID.
    Raw {
        pid: Option<u8>,
        payload: Vec<u8>,
    },

    /// Connectionless UI frame.
    UnitData {
        pid: Option<u8>,
        payload: Vec<u8>,
    },
}

/// Output of the state machine.
#[derive(Debug, PartialEq)]
pub enum ReturnEvent {
    /// Frame to transmit, and whether it's a command.
    Frame(Frame, bool),
    Indication(Indication),
    Data(Delivery),
}

pub enum Action {
    State(Box<dyn State>),
    Send(Frame, bool),
    Indicate(Indication),
    Deliver(Delivery),
}

/// An information field waiting to be sent, or to be acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedFrame {
    pub pid: Option<u8>,
    pub payload: Vec<u8>,
}

/// Link Control Block.
#[derive(Debug)]
pub struct Data {
    pub(crate) config: Config,
    pub(crate) modulus: Modulus,
    pub(crate) window: u8,

    pub(crate) vs: u8,
    pub(crate) vr: u8,
    pub(crate) va: u8,

    pub(crate) peer_receiver_busy: bool,
    pub(crate) own_receiver_busy: bool,
    pub(crate) reject_exception: bool,
    pub(crate) acknowledge_pending: bool,

    pub(crate) n2count: u32,
    pub(crate) dama_slave: bool,

    pub(crate) rtt: Duration,
    pub(crate) t1v: Duration,
    pub(crate) t1: Timer,
    pub(crate) t2: Timer,
    pub(crate) t3: Timer,
    pub(crate) idle: Timer,

    pub(crate) write_queue: VecDeque<QueuedFrame>,
    pub(crate) ack_queue: VecDeque<QueuedFrame>,
    pub(crate) reassembly: Reassembler,
}

impl Data {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let modulus = Modulus::from_extended(config.extended);
        Self {
            window: config.window_for(modulus),
            modulus,
            vs: 0,
            vr: 0,
            va: 0,
            peer_receiver_busy: false,
            own_receiver_busy: false,
            reject_exception: false,
            acknowledge_pending: false,
            n2count: 0,
            dama_slave: false,
            rtt: config.t1 / 2,
            t1v: config.t1,
            t1: Timer::default(),
            t2: Timer::default(),
            t3: Timer::default(),
            idle: Timer::default(),
            write_queue: VecDeque::new(),
            ack_queue: VecDeque::new(),
            reassembly: Reassembler::default(),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
    #[must_use]
    pub fn modulus(&self) -> Modulus {
        self.modulus
    }
    #[must_use]
    pub fn vs(&self) -> u8 {
        self.vs
    }
    #[must_use]
    pub fn vr(&self) -> u8 {
        self.vr
    }
    #[must_use]
    pub fn va(&self) -> u8 {
        self.va
    }
    #[must_use]
    pub fn n2count(&self) -> u32 {
        self.n2count
    }
    #[must_use]
    pub fn window(&self) -> u8 {
        self.window
    }
    #[must_use]
    pub fn peer_busy(&self) -> bool {
        self.peer_receiver_busy
    }
    #[must_use]
    pub fn own_busy(&self) -> bool {
        self.own_receiver_busy
    }
    #[must_use]
    pub fn reject_pending(&self) -> bool {
        self.reject_exception
    }
    #[must_use]
    pub fn ack_pending(&self) -> bool {
        self.acknowledge_pending
    }
    #[must_use]
    pub fn dama_slave(&self) -> bool {
        self.dama_slave
    }

    /// Frames sent but not yet acknowledged.
    #[must_use]
    pub fn unacked(&self) -> usize {
        self.ack_queue.len()
    }

    /// Frames not yet sent.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.write_queue.len()
    }

    /// Time until the next timer expires, if any is running.
    #[must_use]
    pub fn next_timer_remaining(&self) -> Option<Duration> {
        [&self.t1, &self.t2, &self.t3, &self.idle]
            .iter()
            .filter_map(|t| t.remaining())
            .min()
    }

    /// The first expired timer, as the event to feed back in.
    #[must_use]
    pub fn expired_timer(&self) -> Option<Event> {
        if self.t1.expired() {
            Some(Event::T1)
        } else if self.t2.expired() {
            Some(Event::T2)
        } else if self.t3.expired() {
            Some(Event::T3)
        } else if self.idle.expired() {
            Some(Event::Idle)
        } else {
            None
        }
    }

    pub(crate) fn set_modulus(&mut self, m: Modulus) {
        self.modulus = m;
        self.window = self.config.window_for(m);
    }

    pub(crate) fn reset_sequence(&mut self) {
        self.vs = 0;
        self.va = 0;
        self.vr = 0;
    }

    /// Which modulus an incoming SABM (false) or SABME (true) asks for,
    /// or None if we won't have it.
    fn acceptable(&self, ext: bool) -> Option<Modulus> {
        let ok = if self.config.is_ax25() {
            !ext || self.config.extended
        } else {
            ext == self.config.extended
        };
        ok.then_some(Modulus::from_extended(ext))
    }
}

pub trait State: Send {
    fn kind(&self) -> LinkState;

    fn name(&self) -> &'static str {
        match self.kind() {
            LinkState::Disconnected => "Disconnected",
            LinkState::AwaitingConnection => "AwaitingConnection",
            LinkState::AwaitingRelease => "AwaitingRelease",
            LinkState::DataTransfer => "DataTransfer",
            LinkState::TimerRecovery => "TimerRecovery",
        }
    }

    fn is_state_connected(&self) -> bool {
        matches!(
            self.kind(),
            LinkState::DataTransfer | LinkState::TimerRecovery
        )
    }

    fn is_state_disconnected(&self) -> bool {
        self.kind() == LinkState::Disconnected
    }

    fn connect(&self, _data: &mut Data, _ext: bool) -> Vec<Action> {
        debug!("{}: ignoring DL-CONNECT", self.name());
        vec![]
    }
    fn disconnect(&self, _data: &mut Data) -> Vec<Action> {
        debug!("{}: ignoring DL-DISCONNECT", self.name());
        vec![]
    }
    fn data(&self, _data: &mut Data, _pid: Option<u8>, payload: Vec<u8>) -> Vec<Action> {
        warn!(
            "{}: not connected, dropping {} octets",
            self.name(),
            payload.len()
        );
        vec![]
    }
    fn busy(&self, data: &mut Data, busy: bool) -> Vec<Action> {
        data.own_receiver_busy = busy;
        vec![]
    }
    fn t1(&self, _data: &mut Data) -> Vec<Action> {
        vec![]
    }
    fn t2(&self, _data: &mut Data) -> Vec<Action> {
        vec![]
    }
    fn t3(&self, _data: &mut Data) -> Vec<Action> {
        vec![]
    }
    fn idle(&self, _data: &mut Data) -> Vec<Action> {
        vec![]
    }

    fn sabm(&self, data: &mut Data, packet: &Sabm) -> Vec<Action>;
    fn sabme(&self, data: &mut Data, packet: &Sabme) -> Vec<Action>;
    fn disc(&self, data: &mut Data, packet: &Disc) -> Vec<Action>;
    fn dm(&self, data: &mut Data, packet: &Dm) -> Vec<Action>;
    fn ua(&self, _data: &mut Data, _packet: &Ua) -> Vec<Action> {
        debug!("{}: ignoring UA", self.name());
        vec![]
    }
    fn rr(&self, _data: &mut Data, _packet: &Rr, _command: bool) -> Vec<Action> {
        vec![]
    }
    fn rnr(&self, _data: &mut Data, _packet: &Rnr, _command: bool) -> Vec<Action> {
        vec![]
    }
    fn rej(&self, _data: &mut Data, _packet: &Rej, _command: bool) -> Vec<Action> {
        vec![]
    }
    fn iframe(&self, _data: &mut Data, _packet: &Iframe, _command: bool) -> Vec<Action> {
        debug!("{}: ignoring I-frame", self.name());
        vec![]
    }
    fn frmr(&self, _data: &mut Data, _packet: &Frmr) -> Vec<Action> {
        vec![]
    }
    fn illegal(&self, _data: &mut Data, _packet: &Illegal) -> Vec<Action> {
        vec![]
    }

    /// UI frames are connectionless, so the same in every state.
    fn ui(&self, data: &mut Data, packet: &Ui) -> Vec<Action> {
        if !data.config.is_ax25() {
            return vec![];
        }
        vec![Action::Deliver(Delivery::UnitData {
            pid: packet.pid,
            payload: packet.payload.clone(),
        })]
    }
}

fn send_ua(poll: bool) -> Action {
    Action::Send(Frame::Ua(Ua { poll }), false)
}

fn send_dm(poll: bool) -> Action {
    Action::Send(Frame::Dm(Dm { poll }), false)
}

fn send_disc() -> Action {
    Action::Send(Frame::Disc(Disc { poll: true }), true)
}

fn indicate(i: Indication) -> Action {
    Action::Indicate(i)
}

/// Disconnected state.
///
/// An LCB in this state is a listener: it takes the next SABM/SABME.
struct Disconnected {}

impl Disconnected {
    fn new() -> Self {
        Self {}
    }

    fn sabm_and_sabme(&self, data: &mut Data, poll: bool, ext: bool) -> Vec<Action> {
        if !data.config.accept_incoming {
            return vec![send_dm(poll)];
        }
        let Some(m) = data.acceptable(ext) else {
            debug!("Refusing {} connect", if ext { "extended" } else { "normal" });
            return vec![send_dm(poll)];
        };
        data.set_modulus(m);
        data.clear_exception_conditions();
        data.reset_sequence();
        data.n2count = 0;
        data.rtt = data.config.t1 / 2;
        data.calculate_t1();
        vec![
            send_ua(poll),
            indicate(Indication::ConnectIndication(Cause::Ok)),
            Action::State(Box::new(Connected::new())),
        ]
    }
}

impl State for Disconnected {
    fn kind(&self) -> LinkState {
        LinkState::Disconnected
    }

    fn connect(&self, data: &mut Data, ext: bool) -> Vec<Action> {
        data.set_modulus(Modulus::from_extended(ext || data.config.extended));
        data.reset_sequence();
        data.rtt = data.config.t1 / 2;
        data.calculate_t1();
        vec![
            data.establish_data_link(),
            Action::State(Box::new(AwaitingConnection::new())),
        ]
    }

    fn sabm(&self, data: &mut Data, packet: &Sabm) -> Vec<Action> {
        self.sabm_and_sabme(data, packet.poll, false)
    }
    fn sabme(&self, data: &mut Data, packet: &Sabme) -> Vec<Action> {
        self.sabm_and_sabme(data, packet.poll, true)
    }
    fn disc(&self, _data: &mut Data, packet: &Disc) -> Vec<Action> {
        vec![send_ua(packet.poll)]
    }
    fn dm(&self, _data: &mut Data, _packet: &Dm) -> Vec<Action> {
        vec![]
    }
}

/// Sent SABM/SABME, waiting for UA.
struct AwaitingConnection {}

impl AwaitingConnection {
    fn new() -> Self {
        Self {}
    }
}

impl State for AwaitingConnection {
    fn kind(&self) -> LinkState {
        LinkState::AwaitingConnection
    }

    fn disconnect(&self, _data: &mut Data) -> Vec<Action> {
        vec![
            indicate(Indication::DisconnectConfirmation(Cause::NotConnected)),
            Action::State(Box::new(Disconnected::new())),
        ]
    }

    // Queued until connected.
    fn data(&self, data: &mut Data, pid: Option<u8>, payload: Vec<u8>) -> Vec<Action> {
        data.enqueue(pid, payload);
        vec![]
    }

    fn t1(&self, data: &mut Data) -> Vec<Action> {
        let mut ret = Vec::new();
        if data.n2count >= data.config.n2 {
            if data.config.is_ax25() && data.modulus.is_extended() {
                info!("No answer to SABME, falling back to SABM");
                data.set_modulus(Modulus::Normal);
                data.n2count = 0;
                ret.push(Action::Send(Frame::Sabm(Sabm { poll: true }), true));
            } else {
                info!("Connection attempt timed out");
                return vec![
                    indicate(Indication::ConnectConfirmation(Cause::Timedout)),
                    Action::State(Box::new(Disconnected::new())),
                ];
            }
        } else {
            data.n2count += 1;
            ret.push(data.send_sabm());
        }
        data.calculate_t1();
        ret
    }

    // Collision: both ends sent SABM. Answer it, but keep waiting for our UA.
    fn sabm(&self, data: &mut Data, packet: &Sabm) -> Vec<Action> {
        if data.modulus.is_extended() {
            vec![send_dm(packet.poll)]
        } else {
            vec![send_ua(packet.poll)]
        }
    }
    fn sabme(&self, data: &mut Data, packet: &Sabme) -> Vec<Action> {
        if data.modulus.is_extended() {
            vec![send_ua(packet.poll)]
        } else {
            vec![send_dm(packet.poll)]
        }
    }
    fn disc(&self, _data: &mut Data, packet: &Disc) -> Vec<Action> {
        vec![send_dm(packet.poll)]
    }
    fn ua(&self, data: &mut Data, packet: &Ua) -> Vec<Action> {
        if !packet.poll && !data.dama_slave {
            debug!("UA without F in AwaitingConnection, ignoring");
            return vec![];
        }
        data.calculate_rtt();
        data.t1.stop();
        data.clear_exception_conditions();
        data.reset_sequence();
        data.n2count = 0;
        vec![
            indicate(Indication::ConnectConfirmation(Cause::Ok)),
            Action::State(Box::new(Connected::new())),
        ]
    }
    fn dm(&self, _data: &mut Data, packet: &Dm) -> Vec<Action> {
        if !packet.poll {
            return vec![];
        }
        info!("Connection refused");
        vec![
            indicate(Indication::ConnectConfirmation(Cause::Refused)),
            Action::State(Box::new(Disconnected::new())),
        ]
    }
}

/// Sent DISC, waiting for UA.
struct AwaitingRelease {}

impl AwaitingRelease {
    fn new() -> Self {
        Self {}
    }

    // A poll for anything but a disconnect gets told we're not connected.
    fn polled(&self, data: &mut Data, poll: bool) -> Vec<Action> {
        if !poll {
            return vec![];
        }
        if data.dama_slave {
            vec![send_disc()]
        } else {
            vec![send_dm(true)]
        }
    }

    fn released(&self, cause: Cause) -> Vec<Action> {
        vec![
            indicate(Indication::DisconnectConfirmation(cause)),
            Action::State(Box::new(Disconnected::new())),
        ]
    }
}

impl State for AwaitingRelease {
    fn kind(&self) -> LinkState {
        LinkState::AwaitingRelease
    }

    fn t1(&self, data: &mut Data) -> Vec<Action> {
        if data.n2count >= data.config.n2 {
            info!("Disconnect timed out");
            let mut ret = Vec::new();
            if data.config.is_ax25() {
                ret.push(send_dm(true));
            }
            ret.extend(self.released(Cause::Timedout));
            return ret;
        }
        data.n2count += 1;
        data.calculate_t1();
        vec![send_disc()]
    }

    fn sabm(&self, data: &mut Data, packet: &Sabm) -> Vec<Action> {
        let mut ret = vec![send_dm(packet.poll)];
        if data.dama_slave {
            ret.push(send_disc());
        }
        ret
    }
    fn sabme(&self, data: &mut Data, packet: &Sabme) -> Vec<Action> {
        self.sabm(data, &Sabm { poll: packet.poll })
    }
    fn disc(&self, data: &mut Data, packet: &Disc) -> Vec<Action> {
        let mut ret = vec![send_ua(packet.poll)];
        if data.dama_slave {
            ret.extend(self.released(Cause::Ok));
        }
        ret
    }
    fn ua(&self, data: &mut Data, packet: &Ua) -> Vec<Action> {
        if packet.poll || data.dama_slave {
            return self.released(Cause::Ok);
        }
        vec![]
    }
    fn dm(&self, _data: &mut Data, packet: &Dm) -> Vec<Action> {
        if packet.poll {
            return self.released(Cause::NotConnected);
        }
        vec![]
    }
    fn rr(&self, data: &mut Data, packet: &Rr, _command: bool) -> Vec<Action> {
        self.polled(data, packet.poll)
    }
    fn rnr(&self, data: &mut Data, packet: &Rnr, _command: bool) -> Vec<Action> {
        self.polled(data, packet.poll)
    }
    fn rej(&self, data: &mut Data, packet: &Rej, _command: bool) -> Vec<Action> {
        self.polled(data, packet.poll)
    }
    fn iframe(&self, data: &mut Data, packet: &Iframe, _command: bool) -> Vec<Action> {
        self.polled(data, packet.poll)
    }
}

// Behaviour shared between DataTransfer and TimerRecovery.

/// SABM/SABME on an established link: start over.
fn reset_session(data: &mut Data, poll: bool, ext: bool) -> Vec<Action> {
    let Some(m) = data.acceptable(ext) else {
        return vec![send_dm(poll)];
    };
    info!("Link reset by peer");
    data.set_modulus(m);
    data.clear_exception_conditions();
    data.n2count = 0;
    data.reset_sequence();
    data.t1.stop();
    data.idle.stop();
    data.requeue_frames();
    vec![send_ua(poll), Action::State(Box::new(Connected::new()))]
}

fn peer_disc(data: &mut Data, poll: bool) -> Vec<Action> {
    info!("Peer disconnected");
    data.clear_queues();
    vec![
        send_ua(poll),
        indicate(Indication::DisconnectIndication(Cause::Ok)),
        Action::State(Box::new(Disconnected::new())),
    ]
}

fn peer_dm() -> Vec<Action> {
    info!("Link reset: DM received while connected");
    vec![
        indicate(Indication::DisconnectIndication(Cause::Reset)),
        Action::State(Box::new(Disconnected::new())),
    ]
}

/// Bad N(R).
fn recover(data: &mut Data) -> Vec<Action> {
    let mut ret = data.nr_error_recovery();
    ret.push(Action::State(Box::new(AwaitingConnection::new())));
    ret
}

/// FRMR, illegal frame, oversized I-frame.
fn reestablish(data: &mut Data) -> Vec<Action> {
    vec![
        data.establish_data_link(),
        Action::State(Box::new(AwaitingConnection::new())),
    ]
}

fn local_disconnect(data: &mut Data) -> Vec<Action> {
    data.clear_queues();
    data.n2count = 0;
    data.t1.stop();
    vec![
        send_disc(),
        Action::State(Box::new(AwaitingRelease::new())),
    ]
}

fn flow(data: &mut Data, busy: bool) -> Vec<Action> {
    if data.own_receiver_busy == busy {
        return vec![];
    }
    data.own_receiver_busy = busy;
    vec![data.timeout_response()]
}

fn t2(data: &mut Data) -> Vec<Action> {
    if !data.acknowledge_pending {
        return vec![];
    }
    vec![data.timeout_response()]
}

fn idle(data: &mut Data) -> Vec<Action> {
    info!("Idle timeout, disconnecting");
    local_disconnect(data)
}

/// Enquiry response for a REJ poll. A DAMA slave only gets to transmit
/// when polled, so it sends its unacknowledged frames right away too.
fn rej_poll_response(data: &mut Data) -> Action {
    if data.dama_slave {
        data.requeue_frames();
    }
    data.enquiry_response()
}

/// RR/RNR/REJ with F set while in timer recovery: the answer to our poll.
fn final_response(data: &mut Data, nr: u8) -> Vec<Action> {
    data.t1.stop();
    if !data.validate_nr(nr) {
        return recover(data);
    }
    data.frames_acked(nr);
    if data.vs == data.va {
        data.n2count = 0;
        return vec![Action::State(Box::new(Connected::new()))];
    }
    data.requeue_frames();
    vec![]
}

fn iframe(data: &mut Data, packet: &Iframe, recovery: bool) -> Vec<Action> {
    if !data.validate_nr(packet.nr) {
        return recover(data);
    }
    if packet.payload.len() > data.config.paclen {
        warn!(
            "I-frame with {} octets exceeds N1 {}",
            packet.payload.len(),
            data.config.paclen
        );
        return reestablish(data);
    }
    if recovery || data.peer_receiver_busy {
        data.frames_acked(packet.nr);
    } else {
        data.check_iframes_acked(packet.nr);
    }
    let mut ret = Vec::new();
    if data.own_receiver_busy {
        if packet.poll {
            ret.push(data.enquiry_response());
        }
        return ret;
    }
    if packet.ns == data.vr {
        data.vr = data.modulus.next(data.vr);
        data.rx_iframe(packet.pid, packet.payload.clone(), &mut ret);
        if data.own_receiver_busy {
            // Not taken. The peer will have to send it again.
            data.vr = packet.ns;
        }
        data.reject_exception = false;
        if packet.poll {
            ret.push(data.enquiry_response());
        } else {
            data.acknowledge_pending = true;
        }
    } else if data.reject_exception {
        if packet.poll {
            ret.push(data.enquiry_response());
        }
    } else {
        debug!("Out of sequence N(S) {}, expected {}", packet.ns, data.vr);
        data.reject_exception = true;
        data.acknowledge_pending = false;
        ret.push(Action::Send(
            Frame::Rej(Rej {
                nr: data.vr,
                poll: packet.poll,
            }),
            false,
        ));
    }
    ret
}

/// Data transfer. Called "Connected" in AX.25.
struct Connected {}

impl Connected {
    fn new() -> Self {
        Self {}
    }

    fn rr_rnr(&self, data: &mut Data, nr: u8, poll: bool, command: bool) -> Vec<Action> {
        let mut ret = Vec::new();
        if command && poll {
            ret.push(data.enquiry_response());
        }
        if !data.validate_nr(nr) {
            ret.extend(recover(data));
            return ret;
        }
        data.check_iframes_acked(nr);
        ret
    }
}

impl State for Connected {
    fn kind(&self) -> LinkState {
        LinkState::DataTransfer
    }

    fn disconnect(&self, data: &mut Data) -> Vec<Action> {
        local_disconnect(data)
    }
    fn data(&self, data: &mut Data, pid: Option<u8>, payload: Vec<u8>) -> Vec<Action> {
        data.enqueue(pid, payload);
        vec![]
    }
    fn busy(&self, data: &mut Data, busy: bool) -> Vec<Action> {
        flow(data, busy)
    }
    fn t1(&self, data: &mut Data) -> Vec<Action> {
        data.n2count = 1;
        vec![
            data.transmit_enquiry(),
            Action::State(Box::new(TimerRecovery::new())),
        ]
    }
    fn t2(&self, data: &mut Data) -> Vec<Action> {
        t2(data)
    }
    fn t3(&self, data: &mut Data) -> Vec<Action> {
        data.n2count = 0;
        vec![
            data.transmit_enquiry(),
            Action::State(Box::new(TimerRecovery::new())),
        ]
    }
    fn idle(&self, data: &mut Data) -> Vec<Action> {
        idle(data)
    }

    fn sabm(&self, data: &mut Data, packet: &Sabm) -> Vec<Action> {
        reset_session(data, packet.poll, false)
    }
    fn sabme(&self, data: &mut Data, packet: &Sabme) -> Vec<Action> {
        reset_session(data, packet.poll, true)
    }
    fn disc(&self, data: &mut Data, packet: &Disc) -> Vec<Action> {
        peer_disc(data, packet.poll)
    }
    fn dm(&self, _data: &mut Data, _packet: &Dm) -> Vec<Action> {
        peer_dm()
    }
    fn rr(&self, data: &mut Data, packet: &Rr, command: bool) -> Vec<Action> {
        data.peer_receiver_busy = false;
        self.rr_rnr(data, packet.nr, packet.poll, command)
    }
    fn rnr(&self, data: &mut Data, packet: &Rnr, command: bool) -> Vec<Action> {
        data.peer_receiver_busy = true;
        self.rr_rnr(data, packet.nr, packet.poll, command)
    }
    fn rej(&self, data: &mut Data, packet: &Rej, command: bool) -> Vec<Action> {
        data.peer_receiver_busy = false;
        let mut ret = Vec::new();
        if command && packet.poll {
            ret.push(rej_poll_response(data));
        }
        if !data.validate_nr(packet.nr) {
            ret.extend(recover(data));
            return ret;
        }
        data.frames_acked(packet.nr);
        data.calculate_rtt();
        data.t1.stop();
        data.n2count = 0;
        data.requeue_frames();
        ret
    }
    fn iframe(&self, data: &mut Data, packet: &Iframe, _command: bool) -> Vec<Action> {
        iframe(data, packet, false)
    }
    fn frmr(&self, data: &mut Data, packet: &Frmr) -> Vec<Action> {
        warn!("FRMR received ({:02x?}), re-establishing", packet.info);
        reestablish(data)
    }
    fn illegal(&self, data: &mut Data, packet: &Illegal) -> Vec<Action> {
        warn!(
            "Illegal frame (control {:#04x}), re-establishing",
            packet.control
        );
        reestablish(data)
    }
}

/// T1 expired while connected. Polling the peer until it answers.
struct TimerRecovery {}

impl TimerRecovery {
    fn new() -> Self {
        Self {}
    }

    fn rr_rnr(&self, data: &mut Data, nr: u8, poll: bool, command: bool) -> Vec<Action> {
        if !command && poll {
            return final_response(data, nr);
        }
        let mut ret = Vec::new();
        if command && poll {
            ret.push(data.enquiry_response());
        }
        if !data.validate_nr(nr) {
            ret.extend(recover(data));
            return ret;
        }
        data.frames_acked(nr);
        ret
    }
}

impl State for TimerRecovery {
    fn kind(&self) -> LinkState {
        LinkState::TimerRecovery
    }

    fn disconnect(&self, data: &mut Data) -> Vec<Action> {
        local_disconnect(data)
    }
    fn data(&self, data: &mut Data, pid: Option<u8>, payload: Vec<u8>) -> Vec<Action> {
        data.enqueue(pid, payload);
        vec![]
    }
    fn busy(&self, data: &mut Data, busy: bool) -> Vec<Action> {
        flow(data, busy)
    }
    fn t1(&self, data: &mut Data) -> Vec<Action> {
        if data.n2count >= data.config.n2 {
            info!("Peer stopped answering, link reset");
            return vec![
                send_dm(true),
                indicate(Indication::DisconnectIndication(Cause::Reset)),
                Action::State(Box::new(Disconnected::new())),
            ];
        }
        data.n2count += 1;
        vec![data.transmit_enquiry()]
    }
    fn t2(&self, data: &mut Data) -> Vec<Action> {
        t2(data)
    }
    fn idle(&self, data: &mut Data) -> Vec<Action> {
        idle(data)
    }

    fn sabm(&self, data: &mut Data, packet: &Sabm) -> Vec<Action> {
        reset_session(data, packet.poll, false)
    }
    fn sabme(&self, data: &mut Data, packet: &Sabme) -> Vec<Action> {
        reset_session(data, packet.poll, true)
    }
    fn disc(&self, data: &mut Data, packet: &Disc) -> Vec<Action> {
        peer_disc(data, packet.poll)
    }
    fn dm(&self, _data: &mut Data, _packet: &Dm) -> Vec<Action> {
        peer_dm()
    }
    fn rr(&self, data: &mut Data, packet: &Rr, command: bool) -> Vec<Action> {
        data.peer_receiver_busy = false;
        self.rr_rnr(data, packet.nr, packet.poll, command)
    }
    fn rnr(&self, data: &mut Data, packet: &Rnr, command: bool) -> Vec<Action> {
        data.peer_receiver_busy = true;
        self.rr_rnr(data, packet.nr, packet.poll, command)
    }
    fn rej(&self, data: &mut Data, packet: &Rej, command: bool) -> Vec<Action> {
        data.peer_receiver_busy = false;
        if !command && packet.poll {
            return final_response(data, packet.nr);
        }
        let mut ret = Vec::new();
        if command && packet.poll {
            ret.push(rej_poll_response(data));
        }
        if !data.validate_nr(packet.nr) {
            ret.extend(recover(data));
            return ret;
        }
        data.frames_acked(packet.nr);
        data.requeue_frames();
        ret
    }
    fn iframe(&self, data: &mut Data, packet: &Iframe, _command: bool) -> Vec<Action> {
        iframe(data, packet, true)
    }
    fn frmr(&self, data: &mut Data, packet: &Frmr) -> Vec<Action> {
        warn!("FRMR received ({:02x?}), re-establishing", packet.info);
        reestablish(data)
    }
    fn illegal(&self, data: &mut Data, packet: &Illegal) -> Vec<Action> {
        warn!(
            "Illegal frame (control {:#04x}), re-establishing",
            packet.control
        );
        reestablish(data)
    }
}

/// A fresh link, in state Disconnected.
#[must_use]
pub fn new() -> Box<dyn State> {
    Box::new(Disconnected::new())
}

fn dispatch(state: &dyn State, data: &mut Data, event: Event) -> Vec<Action> {
    match event {
        Event::Connect(ext) => state.connect(data, ext),
        Event::Disconnect => state.disconnect(data),
        Event::Data(pid, payload) => state.data(data, pid, payload),
        Event::Busy(b) => state.busy(data, b),
        Event::T1 => {
            data.t1.stop();
            state.t1(data)
        }
        Event::T2 => {
            data.t2.stop();
            state.t2(data)
        }
        Event::T3 => {
            data.t3.stop();
            state.t3(data)
        }
        Event::Idle => {
            data.idle.stop();
            state.idle(data)
        }
        Event::Frame {
            frame,
            command,
            dama,
        } => {
            if dama && data.config.is_ax25() && !data.dama_slave {
                info!("Peer is a DAMA master");
                data.dama_slave = true;
            }
            debug!(
                "{}: got {} ({}, P/F={})",
                state.name(),
                frame.name(),
                if command { "command" } else { "response" },
                frame.poll()
            );
            match &frame {
                Frame::Sabm(p) => state.sabm(data, p),
                Frame::Sabme(p) => state.sabme(data, p),
                Frame::Disc(p) => state.disc(data, p),
                Frame::Ua(p) => state.ua(data, p),
                Frame::Dm(p) => state.dm(data, p),
                Frame::Frmr(p) => state.frmr(data, p),
                Frame::Ui(p) => state.ui(data, p),
                Frame::Rr(p) => state.rr(data, p, command),
                Frame::Rnr(p) => state.rnr(data, p, command),
                Frame::Rej(p) => state.rej(data, p, command),
                Frame::Iframe(p) => state.iframe(data, p, command),
                Frame::Illegal(p) => state.illegal(data, p),
            }
        }
    }
}

/// Run one event through the state machine.
///
/// Returns the new state, if it changed, and everything the caller needs to
/// act on: frames to send, indications, data.
pub fn handle(
    state: &dyn State,
    data: &mut Data,
    event: Event,
) -> (Option<Box<dyn State>>, Vec<ReturnEvent>) {
    let actions = dispatch(state, data, event);

    let mut ret = Vec::new();
    let mut next = None;
    for act in actions {
        match act {
            Action::State(s) => next = Some(s),
            Action::Send(f, command) => ret.push(ReturnEvent::Frame(f, command)),
            Action::Indicate(i) => ret.push(ReturnEvent::Indication(i)),
            Action::Deliver(d) => ret.push(ReturnEvent::Data(d)),
        }
    }

    let kind = next.as_ref().map_or(state.kind(), |s| s.kind());
    if kind != state.kind() {
        info!("{} -> {}", state.name(), next.as_ref().map_or("", |s| s.name()));
    }
    for act in data.after_event(kind) {
        if let Action::Send(f, command) = act {
            ret.push(ReturnEvent::Frame(f, command));
        }
    }
    (next, ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{PID_IP, PID_SEGMENT, PID_TEXT};

    fn assert_all(want: &[ReturnEvent], got: &[ReturnEvent], more: &str) {
        for w in want {
            assert!(
                got.iter().any(|g| g == w),
                "Did not find {w:?} in {more}: {got:?}"
            );
        }
        assert_eq!(
            want.len(),
            got.len(),
            "got and want different lengths for {more}:\nwant: {want:?}\ngot: {got:?}"
        );
    }

    struct TestLink {
        state: Box<dyn State>,
        data: Data,
    }

    impl TestLink {
        fn new(config: Config) -> Self {
            Self {
                state: new(),
                data: Data::new(config),
            }
        }
        fn ev(&mut self, e: Event) -> Vec<ReturnEvent> {
            let (s, ret) = handle(&*self.state, &mut self.data, e);
            if let Some(s) = s {
                self.state = s;
            }
            ret
        }
        fn rx(&mut self, frame: Frame, command: bool) -> Vec<ReturnEvent> {
            self.ev(Event::Frame {
                frame,
                command,
                dama: false,
            })
        }
        fn kind(&self) -> LinkState {
            self.state.kind()
        }

        /// Passive open, straight to DataTransfer.
        fn connected(config: Config) -> Self {
            let mut l = Self::new(config);
            l.rx(Frame::Sabm(Sabm { poll: true }), true);
            assert_eq!(l.kind(), LinkState::DataTransfer);
            l
        }

        fn in_state3_with_vr(vr: u8) -> Self {
            let mut l = Self::connected(Config::ax25());
            l.data.vr = vr;
            l
        }
    }

    fn iframe_with(ns: u8, nr: u8, poll: bool, payload: &[u8]) -> Frame {
        Frame::Iframe(Iframe {
            ns,
            nr,
            poll,
            pid: Some(PID_TEXT),
            payload: payload.to_vec(),
        })
    }

    fn raw(payload: &[u8]) -> ReturnEvent {
        ReturnEvent::Data(Delivery::Raw {
            pid: Some(PID_TEXT),
            payload: payload.to_vec(),
        })
    }

    fn sent_iframes(events: &[ReturnEvent]) -> Vec<(u8, bool)> {
        events
            .iter()
            .filter_map(|e| match e {
                ReturnEvent::Frame(Frame::Iframe(i), true) => Some((i.ns, i.poll)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn passive_open() {
        let mut l = TestLink::new(Config::ax25());
        let events = l.rx(Frame::Sabm(Sabm { poll: true }), true);
        assert_all(
            &[
                ReturnEvent::Frame(Frame::Ua(Ua { poll: true }), false),
                ReturnEvent::Indication(Indication::ConnectIndication(Cause::Ok)),
            ],
            &events,
            "connect",
        );
        assert_eq!(l.kind(), LinkState::DataTransfer);
        assert_eq!((l.data.vs, l.data.vr, l.data.va), (0, 0, 0));
        assert!(!l.data.t1.running());
        assert!(l.data.t3.running());
    }

    #[test]
    fn passive_open_refused() {
        let mut c = Config::ax25();
        c.accept_incoming = false;
        let mut l = TestLink::new(c);
        let events = l.rx(Frame::Sabm(Sabm { poll: true }), true);
        assert_all(
            &[ReturnEvent::Frame(Frame::Dm(Dm { poll: true }), false)],
            &events,
            "refuse",
        );
        assert_eq!(l.kind(), LinkState::Disconnected);
    }

    #[test]
    fn sabme_needs_extended() {
        let mut l = TestLink::new(Config::ax25());
        let events = l.rx(Frame::Sabme(Sabme { poll: true }), true);
        assert_all(
            &[ReturnEvent::Frame(Frame::Dm(Dm { poll: true }), false)],
            &events,
            "sabme",
        );

        let mut l = TestLink::new(Config::ax25().extended(true));
        l.rx(Frame::Sabme(Sabme { poll: true }), true);
        assert_eq!(l.kind(), LinkState::DataTransfer);
        assert_eq!(l.data.modulus, Modulus::Extended);
        assert_eq!(l.data.window, 32);
    }

    #[test]
    fn lapb_mode_must_match() {
        let mut l = TestLink::new(Config::lapb().extended(true));
        let events = l.rx(Frame::Sabm(Sabm { poll: true }), true);
        assert_all(
            &[ReturnEvent::Frame(Frame::Dm(Dm { poll: true }), false)],
            &events,
            "sabm to extended",
        );
        l.rx(Frame::Sabme(Sabme { poll: false }), true);
        assert_eq!(l.kind(), LinkState::DataTransfer);
    }

    #[test]
    fn disc_while_disconnected() {
        let mut l = TestLink::new(Config::lapb());
        let events = l.rx(Frame::Disc(Disc { poll: true }), true);
        assert_all(
            &[ReturnEvent::Frame(Frame::Ua(Ua { poll: true }), false)],
            &events,
            "disc",
        );
        assert_eq!(l.kind(), LinkState::Disconnected);
    }

    #[test]
    fn active_open() {
        let mut l = TestLink::new(Config::ax25());
        let events = l.ev(Event::Connect(false));
        assert_all(
            &[ReturnEvent::Frame(Frame::Sabm(Sabm { poll: true }), true)],
            &events,
            "connect",
        );
        assert_eq!(l.kind(), LinkState::AwaitingConnection);
        assert!(l.data.t1.running());

        // UA without F doesn't count.
        assert!(l.rx(Frame::Ua(Ua { poll: false }), false).is_empty());
        assert_eq!(l.kind(), LinkState::AwaitingConnection);

        let events = l.rx(Frame::Ua(Ua { poll: true }), false);
        assert_all(
            &[ReturnEvent::Indication(Indication::ConnectConfirmation(
                Cause::Ok,
            ))],
            &events,
            "ua",
        );
        assert_eq!(l.kind(), LinkState::DataTransfer);
        assert!(!l.data.t1.running());
    }

    #[test]
    fn active_open_refused() {
        let mut l = TestLink::new(Config::ax25());
        l.ev(Event::Connect(false));
        let events = l.rx(Frame::Dm(Dm { poll: true }), false);
        assert_all(
            &[ReturnEvent::Indication(Indication::ConnectConfirmation(
                Cause::Refused,
            ))],
            &events,
            "dm",
        );
        assert_eq!(l.kind(), LinkState::Disconnected);
        assert!(l.data.next_timer_remaining().is_none());
    }

    #[test]
    fn collision() {
        let mut l = TestLink::new(Config::ax25());
        l.ev(Event::Connect(false));
        let events = l.rx(Frame::Sabm(Sabm { poll: true }), true);
        assert_all(
            &[ReturnEvent::Frame(Frame::Ua(Ua { poll: true }), false)],
            &events,
            "sabm collision",
        );
        assert_eq!(l.kind(), LinkState::AwaitingConnection);
        let events = l.rx(Frame::Sabme(Sabme { poll: true }), true);
        assert_all(
            &[ReturnEvent::Frame(Frame::Dm(Dm { poll: true }), false)],
            &events,
            "sabme collision",
        );
        let events = l.rx(Frame::Disc(Disc { poll: true }), true);
        assert_all(
            &[ReturnEvent::Frame(Frame::Dm(Dm { poll: true }), false)],
            &events,
            "disc",
        );
        assert_eq!(l.kind(), LinkState::AwaitingConnection);
    }

    #[test]
    fn connect_retries_then_times_out() {
        let mut l = TestLink::new(Config::lapb().n2(2));
        l.ev(Event::Connect(false));
        for _ in 0..2 {
            let events = l.ev(Event::T1);
            assert_all(
                &[ReturnEvent::Frame(Frame::Sabm(Sabm { poll: true }), true)],
                &events,
                "retry",
            );
            assert!(l.data.t1.running());
        }
        let events = l.ev(Event::T1);
        assert_all(
            &[ReturnEvent::Indication(Indication::ConnectConfirmation(
                Cause::Timedout,
            ))],
            &events,
            "timeout",
        );
        assert_eq!(l.kind(), LinkState::Disconnected);
    }

    #[test]
    fn sabme_falls_back_to_sabm() {
        let mut l = TestLink::new(Config::ax25().extended(true).n2(1));
        let events = l.ev(Event::Connect(true));
        assert_all(
            &[ReturnEvent::Frame(Frame::Sabme(Sabme { poll: true }), true)],
            &events,
            "connect",
        );
        l.ev(Event::T1);
        let events = l.ev(Event::T1);
        assert_all(
            &[ReturnEvent::Frame(Frame::Sabm(Sabm { poll: true }), true)],
            &events,
            "fallback",
        );
        assert_eq!(l.data.modulus, Modulus::Normal);
        assert_eq!(l.data.n2count, 0);
        assert_eq!(l.kind(), LinkState::AwaitingConnection);
    }

    #[test]
    fn disconnect_while_connecting() {
        let mut l = TestLink::new(Config::ax25());
        l.ev(Event::Connect(false));
        let events = l.ev(Event::Disconnect);
        assert_all(
            &[ReturnEvent::Indication(Indication::DisconnectConfirmation(
                Cause::NotConnected,
            ))],
            &events,
            "disconnect",
        );
        assert_eq!(l.kind(), LinkState::Disconnected);
    }

    #[test]
    fn release() {
        let mut l = TestLink::connected(Config::ax25());
        let events = l.ev(Event::Disconnect);
        assert_all(
            &[ReturnEvent::Frame(Frame::Disc(Disc { poll: true }), true)],
            &events,
            "disconnect",
        );
        assert_eq!(l.kind(), LinkState::AwaitingRelease);
        assert!(l.data.t1.running());

        // Polled while releasing.
        let events = l.rx(Frame::Rr(Rr { nr: 0, poll: true }), true);
        assert_all(
            &[ReturnEvent::Frame(Frame::Dm(Dm { poll: true }), false)],
            &events,
            "rr",
        );
        let events = l.rx(Frame::Sabm(Sabm { poll: true }), true);
        assert_all(
            &[ReturnEvent::Frame(Frame::Dm(Dm { poll: true }), false)],
            &events,
            "sabm",
        );
        let events = l.rx(Frame::Disc(Disc { poll: true }), true);
        assert_all(
            &[ReturnEvent::Frame(Frame::Ua(Ua { poll: true }), false)],
            &events,
            "disc",
        );
        assert_eq!(l.kind(), LinkState::AwaitingRelease);

        let events = l.rx(Frame::Ua(Ua { poll: true }), false);
        assert_all(
            &[ReturnEvent::Indication(Indication::DisconnectConfirmation(
                Cause::Ok,
            ))],
            &events,
            "ua",
        );
        assert_eq!(l.kind(), LinkState::Disconnected);
    }

    #[test]
    fn release_dm() {
        let mut l = TestLink::connected(Config::lapb());
        l.ev(Event::Disconnect);
        assert!(l.rx(Frame::Dm(Dm { poll: false }), false).is_empty());
        assert_eq!(l.kind(), LinkState::AwaitingRelease);
        let events = l.rx(Frame::Dm(Dm { poll: true }), false);
        assert_all(
            &[ReturnEvent::Indication(Indication::DisconnectConfirmation(
                Cause::NotConnected,
            ))],
            &events,
            "dm",
        );
        assert_eq!(l.kind(), LinkState::Disconnected);
    }

    #[test]
    fn release_times_out() {
        let mut l = TestLink::connected(Config::ax25().n2(1));
        l.ev(Event::Disconnect);
        let events = l.ev(Event::T1);
        assert_all(
            &[ReturnEvent::Frame(Frame::Disc(Disc { poll: true }), true)],
            &events,
            "retry",
        );
        let events = l.ev(Event::T1);
        assert_all(
            &[
                ReturnEvent::Frame(Frame::Dm(Dm { poll: true }), false),
                ReturnEvent::Indication(Indication::DisconnectConfirmation(Cause::Timedout)),
            ],
            &events,
            "give up",
        );
        assert_eq!(l.kind(), LinkState::Disconnected);
    }

    #[test]
    fn dama_release() {
        let mut l = TestLink::connected(Config::ax25());
        l.ev(Event::Disconnect);
        let events = l.ev(Event::Frame {
            frame: Frame::Rr(Rr { nr: 0, poll: true }),
            command: true,
            dama: true,
        });
        assert!(l.data.dama_slave);
        assert_all(
            &[ReturnEvent::Frame(Frame::Disc(Disc { poll: true }), true)],
            &events,
            "dama poll",
        );
        // A DAMA master's UA needs no F.
        l.rx(Frame::Ua(Ua { poll: false }), false);
        assert_eq!(l.kind(), LinkState::Disconnected);
        assert!(!l.data.dama_slave);
    }

    #[test]
    fn peer_disconnects() {
        let mut l = TestLink::connected(Config::ax25());
        l.ev(Event::Data(None, b"pending".to_vec()));
        let events = l.rx(Frame::Disc(Disc { poll: true }), true);
        assert_all(
            &[
                ReturnEvent::Frame(Frame::Ua(Ua { poll: true }), false),
                ReturnEvent::Indication(Indication::DisconnectIndication(Cause::Ok)),
            ],
            &events,
            "disc",
        );
        assert_eq!(l.kind(), LinkState::Disconnected);
        assert_eq!(l.data.unacked(), 0);
        assert!(l.data.next_timer_remaining().is_none());
    }

    #[test]
    fn peer_dm_resets() {
        let mut l = TestLink::connected(Config::ax25());
        let events = l.rx(Frame::Dm(Dm { poll: false }), false);
        assert_all(
            &[ReturnEvent::Indication(Indication::DisconnectIndication(
                Cause::Reset,
            ))],
            &events,
            "dm",
        );
        assert_eq!(l.kind(), LinkState::Disconnected);
    }

    #[test]
    fn in_order_delivery() {
        let mut l = TestLink::in_state3_with_vr(5);
        let events = l.rx(iframe_with(5, 0, false, b"X"), true);
        assert_all(&[raw(b"X")], &events, "iframe");
        assert_eq!(l.data.vr, 6);
        assert!(l.data.acknowledge_pending);
        assert!(l.data.t2.running());

        // T2 flushes the ack.
        let events = l.ev(Event::T2);
        assert_all(
            &[ReturnEvent::Frame(Frame::Rr(Rr { nr: 6, poll: false }), false)],
            &events,
            "t2",
        );
        assert!(!l.data.acknowledge_pending);
        assert!(!l.data.t2.running());
    }

    #[test]
    fn poll_gets_immediate_response() {
        let mut l = TestLink::connected(Config::ax25());
        let events = l.rx(iframe_with(0, 0, true, b"a"), true);
        assert_all(
            &[
                raw(b"a"),
                ReturnEvent::Frame(Frame::Rr(Rr { nr: 1, poll: true }), false),
            ],
            &events,
            "polled iframe",
        );
        assert!(!l.data.acknowledge_pending);

        let events = l.rx(Frame::Rr(Rr { nr: 0, poll: true }), true);
        assert_all(
            &[ReturnEvent::Frame(Frame::Rr(Rr { nr: 1, poll: true }), false)],
            &events,
            "polled rr",
        );
    }

    #[test]
    fn out_of_order_rejects_once() {
        let mut l = TestLink::in_state3_with_vr(5);
        let events = l.rx(iframe_with(7, 0, false, b"late"), true);
        assert_all(
            &[ReturnEvent::Frame(Frame::Rej(Rej { nr: 5, poll: false }), false)],
            &events,
            "first",
        );
        assert!(l.data.reject_exception);
        assert_eq!(l.data.vr, 5);

        let events = l.rx(iframe_with(7, 0, false, b"late"), true);
        assert_all(&[], &events, "second");

        // Back in sequence.
        let events = l.rx(iframe_with(5, 0, false, b"ok"), true);
        assert_all(&[raw(b"ok")], &events, "resync");
        assert!(!l.data.reject_exception);
        assert_eq!(l.data.vr, 6);
    }

    #[test]
    fn in_order_across_wrap() {
        let mut l = TestLink::connected(Config::ax25());
        let mut got = Vec::new();
        for i in 0..20u8 {
            let ns = i % 8;
            let mut events = l.rx(iframe_with(ns, 0, false, &[i]), true);
            // A duplicate never gets delivered.
            events.extend(l.rx(iframe_with(ns, 0, false, &[0xFF]), true));
            for e in events {
                if let ReturnEvent::Data(Delivery::Raw { payload, .. }) = e {
                    got.extend(payload);
                }
            }
        }
        assert_eq!(got, (0..20).collect::<Vec<u8>>());
    }

    #[test]
    fn transmit_window() {
        let mut l = TestLink::connected(Config::ax25().window(3));
        let mut events = Vec::new();
        for i in 0..5u8 {
            events.extend(l.ev(Event::Data(None, vec![i])));
        }
        // Window closes on the third frame, which carries the poll.
        assert_eq!(sent_iframes(&events), vec![(0, false), (1, false), (2, true)]);
        assert_eq!(l.data.vs, 3);
        assert_eq!(l.data.unacked(), 3);
        assert_eq!(l.data.queued(), 2);
        assert!(l.data.t1.running());
        assert!(!l.data.t3.running());

        // Ack two, two more go out.
        let events = l.rx(Frame::Rr(Rr { nr: 2, poll: false }), false);
        assert_eq!(sent_iframes(&events), vec![(3, false), (4, true)]);
        assert_eq!(l.data.va, 2);
        assert_eq!(l.data.vs, 5);

        // Ack all.
        let events = l.rx(Frame::Rr(Rr { nr: 5, poll: false }), false);
        assert!(sent_iframes(&events).is_empty());
        assert_eq!(l.data.va, 5);
        assert_eq!(l.data.unacked(), 0);
        assert!(!l.data.t1.running());
        assert!(l.data.t3.running());
    }

    #[test]
    fn peer_busy_holds_transmission() {
        let mut l = TestLink::connected(Config::ax25());
        l.rx(Frame::Rnr(Rnr { nr: 0, poll: false }), false);
        assert!(l.data.peer_receiver_busy);
        let events = l.ev(Event::Data(None, b"wait".to_vec()));
        assert!(sent_iframes(&events).is_empty());
        let events = l.rx(Frame::Rr(Rr { nr: 0, poll: false }), false);
        assert_eq!(sent_iframes(&events), vec![(0, false)]);
    }

    #[test]
    fn rej_retransmits() {
        let mut l = TestLink::connected(Config::ax25().window(4));
        for i in 0..3u8 {
            l.ev(Event::Data(None, vec![i]));
        }
        assert_eq!(l.data.vs, 3);
        let events = l.rx(Frame::Rej(Rej { nr: 1, poll: false }), false);
        assert_eq!(sent_iframes(&events), vec![(1, false), (2, false)]);
        assert_eq!(l.data.va, 1);
        assert_eq!(l.data.vs, 3);
    }

    #[test]
    fn dama_rej_poll_resends() {
        let mut l = TestLink::connected(Config::ax25().window(4));
        l.ev(Event::Frame {
            frame: Frame::Rr(Rr { nr: 0, poll: false }),
            command: false,
            dama: true,
        });
        assert!(l.data.dama_slave);
        let events = l.ev(Event::Data(None, vec![1]));
        // No poll bit for a DAMA slave.
        assert_eq!(sent_iframes(&events), vec![(0, false)]);
        let events = l.rx(Frame::Rej(Rej { nr: 0, poll: true }), true);
        assert!(events.contains(&ReturnEvent::Frame(
            Frame::Rr(Rr { nr: 0, poll: true }),
            false
        )));
        assert_eq!(sent_iframes(&events), vec![(0, false)]);
    }

    #[test]
    fn invalid_nr_recovers() {
        let mut l = TestLink::connected(Config::ax25());
        l.ev(Event::Data(None, b"x".to_vec()));
        let events = l.rx(Frame::Rr(Rr { nr: 4, poll: false }), false);
        assert_all(
            &[ReturnEvent::Frame(Frame::Sabm(Sabm { poll: true }), true)],
            &events,
            "bad nr",
        );
        assert_eq!(l.kind(), LinkState::AwaitingConnection);
        assert_eq!(l.data.unacked(), 0);
        assert_eq!(l.data.queued(), 0);
    }

    #[test]
    fn frmr_and_illegal_reestablish() {
        let mut l = TestLink::connected(Config::lapb());
        let events = l.rx(
            Frame::Frmr(Frmr {
                poll: false,
                info: vec![1, 2, 3],
            }),
            false,
        );
        assert_all(
            &[ReturnEvent::Frame(Frame::Sabm(Sabm { poll: true }), true)],
            &events,
            "frmr",
        );
        assert_eq!(l.kind(), LinkState::AwaitingConnection);

        let mut l = TestLink::connected(Config::ax25());
        l.rx(Frame::Illegal(Illegal { control: 0xe3 }), true);
        assert_eq!(l.kind(), LinkState::AwaitingConnection);
    }

    #[test]
    fn reestablish_renumbers_unacked() {
        let mut l = TestLink::connected(Config::ax25().window(4));
        l.ev(Event::Data(None, b"old1".to_vec()));
        l.ev(Event::Data(None, b"old2".to_vec()));
        assert_eq!((l.data.vs, l.data.unacked()), (2, 2));

        l.rx(
            Frame::Frmr(Frmr {
                poll: false,
                info: vec![],
            }),
            false,
        );
        assert_eq!(l.kind(), LinkState::AwaitingConnection);
        assert_eq!((l.data.vs, l.data.va), (0, 0));
        assert_eq!((l.data.unacked(), l.data.queued()), (0, 2));

        // Link back up: the old frames go out again from zero.
        let events = l.rx(Frame::Ua(Ua { poll: true }), false);
        assert_eq!(l.kind(), LinkState::DataTransfer);
        assert_eq!(sent_iframes(&events), vec![(0, false), (1, false)]);

        let events = l.ev(Event::Data(None, b"new".to_vec()));
        assert_eq!(sent_iframes(&events), vec![(2, false)]);
        l.rx(Frame::Rr(Rr { nr: 1, poll: false }), false);
        assert_eq!((l.data.va, l.data.vs), (1, 3));
        assert_eq!(l.data.unacked(), 2);

        let events = l.rx(Frame::Rej(Rej { nr: 1, poll: false }), false);
        let resent: Vec<(u8, Vec<u8>)> = events
            .iter()
            .filter_map(|e| match e {
                ReturnEvent::Frame(Frame::Iframe(i), true) => Some((i.ns, i.payload.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            resent,
            vec![(1, b"old2".to_vec()), (2, b"new".to_vec())]
        );
        assert_eq!(l.data.unacked(), 2);
        assert_eq!((l.data.va, l.data.vs), (1, 3));
    }

    #[test]
    fn polled_bad_nr_answers_first() {
        for frame in [
            Frame::Rr(Rr { nr: 4, poll: true }),
            Frame::Rnr(Rnr { nr: 4, poll: true }),
            Frame::Rej(Rej { nr: 4, poll: true }),
        ] {
            for recovering in [false, true] {
                let mut l = TestLink::in_state3_with_vr(2);
                if recovering {
                    l.ev(Event::T1);
                    assert_eq!(l.kind(), LinkState::TimerRecovery);
                }
                let events = l.rx(frame.clone(), true);
                assert_all(
                    &[
                        ReturnEvent::Frame(Frame::Rr(Rr { nr: 2, poll: true }), false),
                        ReturnEvent::Frame(Frame::Sabm(Sabm { poll: true }), true),
                    ],
                    &events,
                    &format!("{frame:?} recovering={recovering}"),
                );
                assert_eq!(l.kind(), LinkState::AwaitingConnection);
            }
        }
    }

    #[test]
    fn oversized_iframe_reestablishes() {
        let mut c = Config::ax25();
        c.paclen = 4;
        let mut l = TestLink::connected(c);
        l.rx(iframe_with(0, 0, false, b"too long"), true);
        assert_eq!(l.kind(), LinkState::AwaitingConnection);
    }

    #[test]
    fn sabm_resets_session() {
        let mut l = TestLink::connected(Config::ax25().window(4));
        l.ev(Event::Data(None, b"a".to_vec()));
        l.rx(iframe_with(0, 0, false, b"b"), true);
        assert_eq!((l.data.vs, l.data.vr), (1, 1));

        let events = l.rx(Frame::Sabm(Sabm { poll: true }), true);
        assert!(events.contains(&ReturnEvent::Frame(Frame::Ua(Ua { poll: true }), false)));
        // Unacked data goes out again, renumbered.
        assert_eq!(sent_iframes(&events), vec![(0, false)]);
        assert_eq!(l.data.vr, 0);
        assert_eq!(l.kind(), LinkState::DataTransfer);
    }

    #[test]
    fn t1_enters_timer_recovery() {
        let mut l = TestLink::connected(Config::ax25());
        l.ev(Event::Data(None, b"a".to_vec()));
        let events = l.ev(Event::T1);
        assert_all(
            &[ReturnEvent::Frame(Frame::Rr(Rr { nr: 0, poll: true }), true)],
            &events,
            "enquiry",
        );
        assert_eq!(l.kind(), LinkState::TimerRecovery);
        assert_eq!(l.data.n2count, 1);
        assert!(l.data.t1.running());
    }

    #[test]
    fn t3_enters_timer_recovery() {
        let mut l = TestLink::connected(Config::ax25());
        let events = l.ev(Event::T3);
        assert_all(
            &[ReturnEvent::Frame(Frame::Rr(Rr { nr: 0, poll: true }), true)],
            &events,
            "keepalive",
        );
        assert_eq!(l.kind(), LinkState::TimerRecovery);
        assert_eq!(l.data.n2count, 0);
        assert!(!l.data.t3.running());
    }

    #[test]
    fn timer_recovery_final_acks_all() {
        let mut l = TestLink::connected(Config::ax25());
        l.ev(Event::Data(None, b"a".to_vec()));
        l.ev(Event::T1);
        l.ev(Event::T1);
        assert_eq!(l.data.n2count, 2);
        let vs = l.data.vs;
        let events = l.rx(Frame::Rr(Rr { nr: vs, poll: true }), false);
        assert!(sent_iframes(&events).is_empty());
        assert_eq!(l.kind(), LinkState::DataTransfer);
        assert_eq!(l.data.n2count, 0);
        assert_eq!(l.data.va, vs);
    }

    #[test]
    fn timer_recovery_final_partial_ack_requeues() {
        let mut l = TestLink::connected(Config::ax25().window(4));
        for i in 0..3u8 {
            l.ev(Event::Data(None, vec![i]));
        }
        l.ev(Event::T1);
        let events = l.rx(Frame::Rr(Rr { nr: 1, poll: true }), false);
        assert_eq!(l.kind(), LinkState::TimerRecovery);
        assert_eq!(l.data.va, 1);
        assert_eq!(sent_iframes(&events), vec![(1, false), (2, false)]);
    }

    #[test]
    fn timer_recovery_command_poll_is_not_final() {
        let mut l = TestLink::connected(Config::ax25());
        l.ev(Event::Data(None, b"a".to_vec()));
        l.ev(Event::T1);
        let events = l.rx(Frame::Rr(Rr { nr: 1, poll: true }), true);
        assert_all(
            &[ReturnEvent::Frame(Frame::Rr(Rr { nr: 0, poll: true }), false)],
            &events,
            "command poll",
        );
        assert_eq!(l.kind(), LinkState::TimerRecovery);
        assert_eq!(l.data.va, 1);
    }

    #[test]
    fn timer_recovery_gives_up() {
        let mut l = TestLink::connected(Config::lapb().n2(2));
        l.ev(Event::Data(None, b"a".to_vec()));
        l.ev(Event::T1);
        l.ev(Event::T1);
        assert_eq!(l.data.n2count, 2);
        let events = l.ev(Event::T1);
        assert_all(
            &[
                ReturnEvent::Frame(Frame::Dm(Dm { poll: true }), false),
                ReturnEvent::Indication(Indication::DisconnectIndication(Cause::Reset)),
            ],
            &events,
            "n2",
        );
        assert_eq!(l.kind(), LinkState::Disconnected);
        assert_eq!(l.data.unacked(), 0);
    }

    #[test]
    fn timer_recovery_sabm_resets_n2() {
        let mut l = TestLink::connected(Config::ax25());
        l.ev(Event::T3);
        l.ev(Event::T1);
        assert_eq!(l.data.n2count, 1);
        l.rx(Frame::Sabm(Sabm { poll: true }), true);
        assert_eq!(l.kind(), LinkState::DataTransfer);
        assert_eq!(l.data.n2count, 0);
    }

    #[test]
    fn flow_control() {
        let mut l = TestLink::connected(Config::ax25());
        let events = l.ev(Event::Busy(true));
        assert_all(
            &[ReturnEvent::Frame(Frame::Rnr(Rnr { nr: 0, poll: false }), false)],
            &events,
            "busy",
        );
        // Dropped while busy, and polls get RNR.
        let events = l.rx(iframe_with(0, 0, true, b"a"), true);
        assert_all(
            &[ReturnEvent::Frame(Frame::Rnr(Rnr { nr: 0, poll: true }), false)],
            &events,
            "busy iframe",
        );
        assert_eq!(l.data.vr, 0);

        let events = l.ev(Event::Busy(false));
        assert_all(
            &[ReturnEvent::Frame(Frame::Rr(Rr { nr: 0, poll: false }), false)],
            &events,
            "ready",
        );
        let events = l.rx(iframe_with(0, 0, false, b"a"), true);
        assert_all(&[raw(b"a")], &events, "after busy");
    }

    #[test]
    fn pid_dispatch() {
        let mut c = Config::ax25();
        c.socket_pid = Some(PID_TEXT);
        let mut l = TestLink::connected(c);
        let events = l.rx(
            Frame::Iframe(Iframe {
                ns: 0,
                nr: 0,
                poll: false,
                pid: Some(PID_IP),
                payload: vec![0x45],
            }),
            true,
        );
        assert_all(&[ReturnEvent::Data(Delivery::Ip(vec![0x45]))], &events, "ip");

        // Nobody wants PID 0x01.
        let events = l.rx(
            Frame::Iframe(Iframe {
                ns: 1,
                nr: 0,
                poll: false,
                pid: Some(0x01),
                payload: vec![1],
            }),
            true,
        );
        assert_all(&[], &events, "unwanted");
        assert!(l.data.own_receiver_busy);
        assert_eq!(l.data.vr, 1);
    }

    #[test]
    fn lapb_delivers_raw() {
        let mut l = TestLink::connected(Config::lapb());
        let events = l.rx(
            Frame::Iframe(Iframe {
                ns: 0,
                nr: 0,
                poll: false,
                pid: None,
                payload: vec![0x10, 0x01],
            }),
            true,
        );
        assert_all(
            &[ReturnEvent::Data(Delivery::Raw {
                pid: None,
                payload: vec![0x10, 0x01],
            })],
            &events,
            "lapb",
        );
    }

    #[test]
    fn segmented_delivery() {
        let mut l = TestLink::connected(Config::ax25());
        let segs = [
            vec![0x82, PID_IP, b'a', b'b'],
            vec![0x01, b'c', b'd'],
            vec![0x00, b'e'],
        ];
        let mut events = Vec::new();
        for (ns, s) in segs.iter().enumerate() {
            events.extend(l.rx(
                Frame::Iframe(Iframe {
                    ns: ns as u8,
                    nr: 0,
                    poll: false,
                    pid: Some(PID_SEGMENT),
                    payload: s.clone(),
                }),
                true,
            ));
        }
        assert_all(
            &[ReturnEvent::Data(Delivery::Ip(b"abcde".to_vec()))],
            &events,
            "reassembled",
        );
        assert_eq!(l.data.vr, 3);
        assert!(!l.data.own_receiver_busy);
    }

    #[test]
    fn segmented_send() {
        let mut c = Config::ax25().window(7);
        c.paclen = 5;
        let mut l = TestLink::connected(c);
        let events = l.ev(Event::Data(Some(PID_IP), b"1234567".to_vec()));
        let infos: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ReturnEvent::Frame(Frame::Iframe(i), _) => Some((i.pid, i.payload.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            infos,
            vec![
                (Some(PID_SEGMENT), vec![0x82, PID_IP, b'1', b'2']),
                (Some(PID_SEGMENT), vec![0x01, b'3', b'4', b'5']),
                (Some(PID_SEGMENT), vec![0x00, b'6', b'7']),
            ]
        );
    }

    #[test]
    fn ui_in_any_state() {
        let mut l = TestLink::new(Config::ax25());
        let events = l.rx(
            Frame::Ui(Ui {
                push: false,
                pid: Some(PID_TEXT),
                payload: b"beacon".to_vec(),
            }),
            true,
        );
        assert_all(
            &[ReturnEvent::Data(Delivery::UnitData {
                pid: Some(PID_TEXT),
                payload: b"beacon".to_vec(),
            })],
            &events,
            "ui",
        );
    }

    #[test]
    fn idle_disconnects() {
        let mut c = Config::ax25();
        c.idle = Some(Duration::from_secs(60));
        let mut l = TestLink::connected(c);
        assert!(l.data.idle.running());
        let events = l.ev(Event::Idle);
        assert_all(
            &[ReturnEvent::Frame(Frame::Disc(Disc { poll: true }), true)],
            &events,
            "idle",
        );
        assert_eq!(l.kind(), LinkState::AwaitingRelease);
    }

    #[test]
    fn sequence_invariants() {
        // Drive a link through sends, acks, rejects, timeouts and
        // re-establishment. The unacked queue must always hold exactly the
        // frames between V(A) and V(S), and V(S) stays within the window.
        let mut l = TestLink::connected(Config::ax25().window(3));
        let mut last_va = 0u8;
        let m = Modulus::Normal;
        let mut acked = 0u32;
        let mut resets = 0u32;
        for step in 0..72u32 {
            let mut reset = false;
            match step % 8 {
                0 | 1 => {
                    l.ev(Event::Data(None, vec![step as u8]));
                }
                2 => {
                    let nr = m.add(l.data.va, 1.min(m.sub(l.data.vs, l.data.va)));
                    l.rx(Frame::Rr(Rr { nr, poll: false }), false);
                }
                3 => {
                    let nr = l.data.va;
                    l.rx(Frame::Rej(Rej { nr, poll: false }), false);
                }
                4 => {
                    l.ev(Event::T1);
                }
                5 => {
                    let nr = l.data.vs;
                    l.rx(Frame::Rr(Rr { nr, poll: true }), false);
                }
                6 if step % 16 == 6 => {
                    l.ev(Event::Data(None, b"pending".to_vec()));
                    l.rx(
                        Frame::Frmr(Frmr {
                            poll: false,
                            info: vec![],
                        }),
                        false,
                    );
                    assert_eq!(l.kind(), LinkState::AwaitingConnection);
                    reset = true;
                }
                6 => {
                    l.ev(Event::Data(None, vec![step as u8]));
                }
                _ => {
                    if l.kind() == LinkState::AwaitingConnection {
                        l.rx(Frame::Ua(Ua { poll: true }), false);
                        resets += 1;
                    } else {
                        let nr = l.data.vs;
                        l.rx(Frame::Rr(Rr { nr, poll: false }), false);
                    }
                }
            }
            let outstanding = m.sub(l.data.vs, l.data.va);
            assert!(outstanding <= l.data.window, "step {step}: {outstanding}");
            assert_eq!(
                l.data.unacked(),
                usize::from(outstanding),
                "step {step}: V(A)={} V(S)={}",
                l.data.va,
                l.data.vs
            );
            if reset {
                last_va = l.data.va;
                continue;
            }
            acked += u32::from(m.sub(l.data.va, last_va));
            assert!(m.sub(l.data.va, last_va) <= l.data.window, "va went backwards");
            last_va = l.data.va;
        }
        assert!(acked > 0);
        assert!(resets > 0);
        assert!(l.state.is_state_connected());
    }
}
