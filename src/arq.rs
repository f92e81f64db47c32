//! Acknowledgement, retransmission and timer procedures on the LCB.
//!
//! These are the building blocks the states in [`crate::state`] are made
//! of. None of them change state.
use std::time::Duration;

use log::{debug, warn};

use crate::config::Backoff;
use crate::frame::{Frame, Iframe, Rnr, Rr, Sabm, Sabme};
use crate::segment::{segment, Reassembly, PID_IP, PID_NETROM, PID_SEGMENT};
use crate::state::{Action, Data, Delivery, LinkState, QueuedFrame};

const RTT_MIN: Duration = Duration::from_millis(10);
const RTT_MAX: Duration = Duration::from_secs(30);

impl Data {
    /// N(R) acknowledges something between V(A) and V(S), inclusive.
    #[must_use]
    pub fn validate_nr(&self, nr: u8) -> bool {
        self.modulus.in_window(self.va, nr, self.vs)
    }

    pub(crate) fn clear_exception_conditions(&mut self) {
        self.peer_receiver_busy = false;
        self.own_receiver_busy = false;
        self.reject_exception = false;
        self.acknowledge_pending = false;
    }

    pub(crate) fn clear_queues(&mut self) {
        self.write_queue.clear();
        self.ack_queue.clear();
        self.reassembly.clear();
    }

    /// Queue a DL-DATA request, segmenting as needed.
    pub(crate) fn enqueue(&mut self, pid: Option<u8>, payload: Vec<u8>) {
        if !self.config.is_ax25() {
            if payload.len() > self.config.paclen {
                warn!(
                    "Dropping {} octets, more than N1 {}",
                    payload.len(),
                    self.config.paclen
                );
                return;
            }
            self.write_queue.push_back(QueuedFrame { pid: None, payload });
            return;
        }
        let pid = pid.unwrap_or(self.config.default_pid);
        match segment(pid, &payload, self.config.paclen) {
            Ok(segs) => {
                for (pid, payload) in segs {
                    self.write_queue.push_back(QueuedFrame {
                        pid: Some(pid),
                        payload,
                    });
                }
            }
            Err(e) => warn!("Dropping data: {e}"),
        }
    }

    /// Drop everything the peer has acknowledged, up to but not including
    /// `nr`.
    pub(crate) fn frames_acked(&mut self, nr: u8) {
        while self.va != nr {
            if self.ack_queue.pop_front().is_none() {
                break;
            }
            self.va = self.modulus.next(self.va);
        }
        if self.va == self.vs {
            self.n2count = 0;
        }
    }

    /// Acknowledge and adjust T1 after a valid N(R) in DataTransfer.
    pub(crate) fn check_iframes_acked(&mut self, nr: u8) {
        if self.vs == nr {
            self.frames_acked(nr);
            self.calculate_rtt();
            self.t1.stop();
        } else if self.va != nr {
            self.frames_acked(nr);
            self.calculate_t1();
            self.t1.stop();
        }
    }

    /// Put every unacknowledged frame back in front of the send queue.
    pub(crate) fn requeue_frames(&mut self) {
        while let Some(f) = self.ack_queue.pop_back() {
            self.write_queue.push_front(f);
        }
    }

    /// RR, or RNR if we're busy, with our V(R).
    fn supervisory(&self, poll: bool) -> Frame {
        if self.own_receiver_busy {
            Frame::Rnr(Rnr { nr: self.vr, poll })
        } else {
            Frame::Rr(Rr { nr: self.vr, poll })
        }
    }

    /// Answer a poll.
    pub(crate) fn enquiry_response(&mut self) -> Action {
        self.acknowledge_pending = false;
        Action::Send(self.supervisory(true), false)
    }

    /// Acknowledge without being asked.
    pub(crate) fn timeout_response(&mut self) -> Action {
        self.acknowledge_pending = false;
        Action::Send(self.supervisory(false), false)
    }

    /// Poll the peer.
    pub(crate) fn transmit_enquiry(&mut self) -> Action {
        self.acknowledge_pending = false;
        self.calculate_t1();
        self.t1.stop();
        Action::Send(self.supervisory(true), true)
    }

    pub(crate) fn send_sabm(&self) -> Action {
        let f = if self.modulus.is_extended() {
            Frame::Sabme(Sabme { poll: true })
        } else {
            Frame::Sabm(Sabm { poll: true })
        };
        Action::Send(f, true)
    }

    /// Send SABM(E). Frames the peer never acknowledged go back on the
    /// write queue, to be numbered afresh once the link is up.
    pub(crate) fn establish_data_link(&mut self) -> Action {
        self.clear_exception_conditions();
        self.requeue_frames();
        self.reset_sequence();
        self.n2count = 0;
        self.t1.stop();
        self.send_sabm()
    }

    pub(crate) fn nr_error_recovery(&mut self) -> Vec<Action> {
        warn!(
            "N(R) error (V(A)={} V(S)={}), re-establishing",
            self.va, self.vs
        );
        self.clear_queues();
        vec![self.establish_data_link()]
    }

    /// T1 for the next retry, from the smoothed round trip time.
    pub(crate) fn calculate_t1(&mut self) {
        let k = match self.config.backoff {
            Backoff::None => 2,
            Backoff::Linear => 2 + 2 * self.n2count,
            Backoff::Exponential => (0..self.n2count).fold(2u32, |t, _| (t * 2).min(8)),
        };
        self.t1v = self.rtt * k;
    }

    /// Fold a T1 measurement into the smoothed round trip time. Only
    /// unretried exchanges count.
    pub(crate) fn calculate_rtt(&mut self) {
        if self.config.backoff == Backoff::None || self.n2count != 0 {
            return;
        }
        let Some(elapsed) = self.t1.elapsed() else {
            return;
        };
        self.rtt = ((self.rtt * 9 + elapsed) / 10).clamp(RTT_MIN, RTT_MAX);
        debug!("RTT now {:?}", self.rtt);
    }

    /// Send queued I-frames, as far as the window allows.
    pub(crate) fn kick(&mut self) -> Vec<Action> {
        let mut ret = Vec::new();
        if self.peer_receiver_busy || self.write_queue.is_empty() {
            return ret;
        }
        let start = if self.ack_queue.is_empty() {
            self.va
        } else {
            self.vs
        };
        let end = self.modulus.add(self.va, self.window);
        if start == end {
            return ret;
        }
        if !self.t1.running() {
            self.calculate_t1();
        }
        self.vs = start;
        while self.vs != end {
            let Some(f) = self.write_queue.pop_front() else {
                break;
            };
            let next = self.modulus.next(self.vs);
            ret.push(Action::Send(
                Frame::Iframe(Iframe {
                    ns: self.vs,
                    nr: self.vr,
                    poll: next == end && !self.dama_slave,
                    pid: f.pid,
                    payload: f.payload.clone(),
                }),
                true,
            ));
            self.ack_queue.push_back(f);
            self.vs = next;
        }
        self.acknowledge_pending = false;
        ret
    }

    /// Start and stop timers to match the state we're in.
    pub(crate) fn set_timers(&mut self, state: LinkState) {
        match state {
            LinkState::Disconnected => {
                self.t1.stop();
                self.t2.stop();
                self.t3.stop();
                self.idle.stop();
                return;
            }
            LinkState::AwaitingConnection | LinkState::AwaitingRelease => {
                self.t1.ensure(self.t1v);
                self.t2.stop();
                self.t3.stop();
                self.idle.stop();
                return;
            }
            LinkState::DataTransfer => {
                if self.vs == self.va {
                    self.t1.stop();
                } else {
                    self.t1.ensure(self.t1v);
                }
                match self.config.t3 {
                    Some(t3) if !self.t1.running() => self.t3.ensure(t3),
                    _ => self.t3.stop(),
                }
            }
            LinkState::TimerRecovery => {
                self.t1.ensure(self.t1v);
                self.t3.stop();
            }
        }
        if self.acknowledge_pending {
            self.t2.ensure(self.config.t2);
        } else {
            self.t2.stop();
        }
        match self.config.idle {
            Some(v) => self.idle.ensure(v),
            None => self.idle.stop(),
        }
    }

    /// Housekeeping after every event, given the state the link ends up in.
    pub(crate) fn after_event(&mut self, state: LinkState) -> Vec<Action> {
        let mut ret = Vec::new();
        match state {
            LinkState::Disconnected => {
                self.clear_queues();
                self.clear_exception_conditions();
                self.dama_slave = false;
            }
            LinkState::DataTransfer | LinkState::TimerRecovery => {
                ret = self.kick();
            }
            _ => {}
        }
        self.set_timers(state);
        ret
    }

    /// Hand an in-sequence I-frame to whoever wants it.
    ///
    /// Sets own-receiver-busy if nobody does.
    pub(crate) fn rx_iframe(&mut self, pid: Option<u8>, payload: Vec<u8>, out: &mut Vec<Action>) {
        // Traffic restarts the idle timer.
        self.idle.stop();

        if !self.config.is_ax25() {
            out.push(Action::Deliver(Delivery::Raw { pid: None, payload }));
            return;
        }
        match pid {
            Some(PID_SEGMENT) => match self.reassembly.push(&payload) {
                Reassembly::Complete(v) => {
                    let Some((&inner, body)) = v.split_first() else {
                        return;
                    };
                    self.rx_iframe(Some(inner), body.to_vec(), out);
                }
                Reassembly::Consumed | Reassembly::Dropped => {}
            },
            Some(PID_IP) if self.config.ip => out.push(Action::Deliver(Delivery::Ip(payload))),
            Some(PID_NETROM) if self.config.netrom => {
                out.push(Action::Deliver(Delivery::NetRom(payload)));
            }
            _ => {
                if self.config.socket_pid.is_some_and(|want| pid != Some(want)) {
                    warn!("No taker for PID {pid:02x?}, going busy");
                    self.own_receiver_busy = true;
                    return;
                }
                out.push(Action::Deliver(Delivery::Raw { pid, payload }));
            }
        }
    }
}
