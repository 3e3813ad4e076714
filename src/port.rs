//! The gateway engine proper: one `Port` per J1708 line.
//!
//! A port frames and validates incoming bytes, screens sources against its
//! access control list, forwards permitted traffic to a linked port, runs the
//! J1587 transport handlers through a deferred-dispatch gate, and drains its
//! transmit queue whenever the bus has been idle long enough for the frame's
//! priority. Everything advances from repeated [`Port::update`] calls; there
//! are no threads and no blocking waits beyond the half-duplex echo check.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, trace, warn};

use crate::acl::Acl;
use crate::checksum;
use crate::interface::{Interface, Led};
use crate::security;
use crate::security::{Detector, FLOOD_SCAN_MS, ROGUE_ALERT_INTERVAL_MS};
use crate::stats::{NetworkStats, WINDOW_MS};
use crate::timer::Timer;
use crate::transport::{
    Session, SessionState, CONTROL_ABORT, CONTROL_CTS, CONTROL_EOM, CONTROL_RTS,
    MAX_TRANSPORT_PAYLOAD, MIN_TRANSPORT_PAYLOAD, PID_TRANSPORT_CONTROL, PID_TRANSPORT_DATA,
    SEGMENT_SIZE, SESSION_TIMEOUT_MS,
};
use crate::txqueue::{TxQueue, PENALTY_US};
use crate::{FRAME_GAP_US, MAX_FRAME_LEN, ONE_BIT_US};

/// MID a port claims until the host configures another.
pub const DEFAULT_MID: u8 = 120;

/// Receive buffer: index 0 is never written, the frame sits at 1..=len.
const RX_BUFFER_SIZE: usize = 22;

/// Normal delay between parses of a candidate transport frame.
const DISPATCH_RATE_MS: u32 = 1_000;
/// Longer delay after a handler has run, letting the bus settle before the
/// next PDU is acted on.
const DISPATCH_COOLDOWN_MS: u32 = 2_000;

/// Error
#[derive(Debug, PartialEq)]
pub enum Error {
    /// The transmit queue was full; the frame was dropped and the access
    /// penalty raised.
    QueueFull,
    /// A transport session is already running in one direction or the other.
    TransportBusy,
    /// Payload length outside what the transport session will carry.
    PayloadSize(usize),
    /// Frame length outside 2..=21 or longer than the supplied data.
    FrameSize(usize),
}

/// Outcome of putting one frame on the wire.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum TxStatus {
    Sent,
    /// Another node's byte came back instead of our MID.
    Collision,
    /// Nothing echoed at all: transceiver fault or a disconnected line.
    NotSent,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Mode {
    /// Full engine: filter, forward, transport, transmit.
    Gateway,
    /// Receive and log only.
    Observer,
}

/// Transport PDU waiting for its deferred handler.
#[derive(Copy, Clone, Debug, PartialEq)]
enum TransportPdu {
    Rts,
    Cts,
    Eom,
    Abort,
    Cdp,
}

/// Message and error tallies. Transmit-queue overflows live with the queue
/// itself and are read through [`Port::tx_overflows`].
#[derive(Clone, Debug, Default)]
pub struct Counters {
    /// Every error of any kind.
    pub errors: u32,
    pub checksum: u32,
    pub rx_overflow: u32,
    pub collision: u32,
    pub not_sent: u32,
    pub high_busload: u32,
    pub spoof: u32,
    pub rogue_self: u32,
    pub rogue_shared: u32,
    pub rogue_host: u32,
    /// Intrusion events of any kind, local or reported by peers.
    pub security_alerts: u32,
    pub rx_frames: u32,
    pub tx_frames: u32,
    pub forwarded: u32,
}

/// Latched condition flags alongside the counters.
#[derive(Clone, Debug, Default)]
pub struct ErrorFlags {
    pub checksum: bool,
    pub rx_overflow: bool,
    pub tx_overflow: bool,
    pub collision: bool,
    pub not_sent: bool,
    pub high_busload: bool,
}

pub struct Port<'a, T>
where
    T: Interface,
{
    pub name: String,
    hw: &'a T,
    port_number: u8,
    mode: Mode,
    mid: u8,
    host_port: bool,
    forwarding: bool,
    /// Whether transport PDUs addressed to us are parsed and answered.
    gateway_processing: bool,
    linked: bool,
    tx_queue: Rc<RefCell<TxQueue>>,
    /// Forwarding handle onto the linked port's transmit queue. The peer is
    /// never owned; dropping the handle is all unlinking takes.
    peer_queue: Option<Rc<RefCell<TxQueue>>>,

    rx_buf: [u8; RX_BUFFER_SIZE],
    rx_count: u8,
    rx_len: u8,
    rx_sum: u8,
    rx_busy: bool,
    tx_busy: bool,
    /// Set after a successful transmit so the echoed frame is recognized as
    /// our own and neither forwarded nor parsed.
    tx_transmitting: bool,
    overflow_mid_hold: Option<u8>,

    /// Snapshot of the frame a pending handler will act on, so a newer frame
    /// cannot overwrite it first.
    loop_buf: [u8; MAX_FRAME_LEN],
    pending: Option<TransportPdu>,
    dispatch_period_ms: u32,

    frame_timer: Timer,
    tx_timer: Timer,
    loop_timer: Timer,
    window_timer: Timer,
    scan_timer: Timer,
    rogue_timer: Timer,
    led_timer: Timer,
    session_timer: Timer,

    session: Session,
    acl: Acl,
    stats: NetworkStats,
    detector: Detector,
    counters: Counters,
    flags: ErrorFlags,

    rx_led: bool,
    tx_led: bool,
    sec_led: bool,
    rx_led_on: bool,
    tx_led_on: bool,
    sec_led_on: bool,
}

impl<'a, T> Port<'a, T>
where
    T: Interface,
{
    /// Construct a `Port` bound to one line.
    /// # Arguments
    /// * `name` - identifier string for log records.
    /// * `hw` - Reference of hardware interface.
    /// * `port_number` - Number of the serial port behind this engine.
    pub fn new(name: String, hw: &'a T, port_number: u8) -> Self {
        let now_us = hw.micros();
        let now_ms = hw.millis();
        let mut acl = Acl::new();
        // Our own MID arriving from the wire is always an anomaly.
        acl.block(DEFAULT_MID);
        Port {
            name: name,
            hw: hw,
            port_number: port_number,
            mode: Mode::Gateway,
            mid: DEFAULT_MID,
            host_port: false,
            forwarding: false,
            gateway_processing: false,
            linked: false,
            tx_queue: Rc::new(RefCell::new(TxQueue::new())),
            peer_queue: None,
            rx_buf: [0; RX_BUFFER_SIZE],
            rx_count: 0,
            rx_len: 0,
            rx_sum: 0,
            rx_busy: false,
            tx_busy: false,
            tx_transmitting: false,
            overflow_mid_hold: None,
            loop_buf: [0; MAX_FRAME_LEN],
            pending: None,
            dispatch_period_ms: DISPATCH_RATE_MS,
            frame_timer: Timer::new(now_us),
            tx_timer: Timer::new(now_us),
            loop_timer: Timer::new(now_ms),
            window_timer: Timer::new(now_ms),
            scan_timer: Timer::new(now_ms),
            rogue_timer: Timer::new(now_ms),
            led_timer: Timer::new(now_ms),
            session_timer: Timer::new(now_ms),
            session: Session::new(),
            acl: acl,
            stats: NetworkStats::new(),
            detector: Detector::new(),
            counters: Counters::default(),
            flags: ErrorFlags::default(),
            rx_led: true,
            tx_led: true,
            sec_led: false,
            rx_led_on: true,
            tx_led_on: true,
            sec_led_on: true,
        }
    }

    /// Install a forwarding handle onto `peer`'s transmit queue and turn
    /// forwarding on. The link is one-directional; link both ways for a
    /// bidirectional gateway.
    pub fn link(&mut self, peer: &Port<'a, T>) {
        self.peer_queue = Some(Rc::clone(&peer.tx_queue));
        self.linked = true;
        self.forwarding = true;
    }

    pub fn unlink(&mut self) {
        self.peer_queue = None;
        self.linked = false;
        self.forwarding = false;
    }

    /// One scheduler tick. Call as often as the hosting loop allows.
    pub fn update(&mut self) {
        match self.mode {
            Mode::Gateway => self.listen(),
            Mode::Observer => self.observe(),
        }
    }

    fn listen(&mut self) {
        if let Some(len) = self.receive() {
            let src = self.rx_buf[1];
            let own_echo = self.tx_transmitting;
            if self.check_acl(src) && self.linked && self.forwarding {
                if let Some(peer) = &self.peer_queue {
                    // the leading delimiter slot stays behind; the forwarded
                    // frame is byte-identical to what arrived
                    let end = 1 + len as usize;
                    if peer.borrow_mut().push(&self.rx_buf[1..end], 0) {
                        self.counters.forwarded += 1;
                    }
                }
            }
            self.toggle_rx_led();
            self.log_frame(len);
            if own_echo {
                self.tx_transmitting = false;
            } else {
                self.gate_dispatch();
            }
        } else {
            if !self.rx_busy {
                self.arbitrate_tx();
            }
            // a handler deferred earlier runs once the line is quiet
            self.dispatch_pending();
        }
        self.update_statistics();
        self.check_network();
    }

    fn observe(&mut self) {
        if let Some(len) = self.receive() {
            self.toggle_rx_led();
            self.log_frame(len);
        }
    }

    /// Take at most one byte off the line and return a completed frame's
    /// length once twelve bit-times of silence close it. Only frames that
    /// pass the checksum are ever returned; everything seen still counts
    /// toward busload.
    pub fn receive(&mut self) -> Option<u8> {
        if self.hw.available() {
            let now = self.hw.micros();
            self.frame_timer.reset(now);
            self.tx_timer.reset(now);
            self.rx_count += 1;
            self.stats.count_byte();
            self.rx_busy = true;
            if (self.rx_count as usize) < RX_BUFFER_SIZE {
                if let Some(byte) = self.hw.read() {
                    self.rx_buf[self.rx_count as usize] = byte;
                    self.rx_sum = self.rx_sum.wrapping_add(byte);
                }
            } else {
                // no gap showed up in time; remember whose frame spilled and
                // drop the rest of the episode
                self.flags.rx_overflow = true;
                self.counters.errors += 1;
                self.counters.rx_overflow += 1;
                self.rx_count = 0;
                self.rx_busy = false;
                if self.overflow_mid_hold.is_none() {
                    self.overflow_mid_hold = Some(self.rx_buf[1]);
                }
                warn!(
                    target: self.name.as_str(),
                    "rx overflow [{}]", self.counters.errors
                );
            }
        }
        if self.rx_count > 0 && self.frame_timer.elapsed(self.hw.micros()) > FRAME_GAP_US {
            let len = self.rx_count;
            self.rx_len = len;
            self.rx_count = 0;
            let body_sum = self.rx_sum.wrapping_sub(self.rx_buf[len as usize]);
            let expected = (!body_sum).wrapping_add(1);
            self.rx_sum = 0;
            self.rx_busy = false;
            if self.flags.rx_overflow {
                // tail of an oversized episode: count the bytes, drop the data
                self.flags.rx_overflow = false;
                if let Some(mid) = self.overflow_mid_hold.take() {
                    self.stats.credit_frame(mid, u32::from(len));
                }
                return None;
            }
            self.stats.credit_frame(self.rx_buf[1], u32::from(len));
            self.counters.rx_frames += 1;
            self.overflow_mid_hold = None;
            if expected == self.rx_buf[len as usize] {
                self.flags.checksum = false;
                return Some(len);
            }
            self.flags.checksum = true;
            self.counters.checksum += 1;
            self.counters.errors += 1;
            warn!(
                target: self.name.as_str(),
                "checksum mismatch from MID 0x{:02X} [{}]", self.rx_buf[1], self.counters.errors
            );
            // invalid data; pretend the frame never arrived
            return None;
        }
        None
    }

    /// Put one frame on the wire with collision detection: write the MID,
    /// wait up to twelve bit-times for it to echo back, and only then burst
    /// the rest. The scheduler calls this for queued frames; calling it
    /// directly bypasses access arbitration.
    pub fn transmit(&mut self, frame: &mut [u8], len: u8, auto_checksum: bool) -> TxStatus {
        self.tx_busy = true;
        let len = len as usize;
        if auto_checksum {
            checksum::append(&mut frame[..len]);
        }
        let mid = frame[0];
        let now = self.hw.micros();
        self.frame_timer.reset(now);
        self.tx_timer.reset(now);
        self.hw.write(mid);
        while !self.hw.available() && self.tx_timer.elapsed(self.hw.micros()) < FRAME_GAP_US {}
        let status = if self.hw.available() {
            if self.hw.peek() == Some(mid) {
                for byte in frame[1..len].iter() {
                    self.hw.write(*byte);
                }
                self.toggle_tx_led();
                self.flags.collision = false;
                self.tx_transmitting = true;
                TxStatus::Sent
            } else {
                // another node won arbitration while our MID went out
                self.flags.collision = true;
                self.counters.collision += 1;
                self.counters.errors += 1;
                warn!(
                    target: self.name.as_str(),
                    "collision on MID 0x{:02X} [{}]", mid, self.counters.errors
                );
                TxStatus::Collision
            }
        } else {
            self.flags.not_sent = true;
            self.counters.not_sent += 1;
            self.counters.errors += 1;
            warn!(
                target: self.name.as_str(),
                "no echo for MID 0x{:02X} [{}]", mid, self.counters.errors
            );
            TxStatus::NotSent
        };
        let now = self.hw.micros();
        self.frame_timer.reset(now);
        self.tx_timer.reset(now);
        self.counters.tx_frames += 1;
        self.tx_busy = false;
        status
    }

    /// Queue a frame for transmission, returning the queued length. The
    /// checksum byte is recomputed on the way out, so callers may leave the
    /// last byte zero.
    pub fn send(&mut self, data: &[u8], len: u8, priority: u8) -> Result<u8, Error> {
        let len = len as usize;
        if len < 2 || len > MAX_FRAME_LEN || data.len() < len {
            return Err(Error::FrameSize(len));
        }
        if self.tx_queue.borrow_mut().push(&data[..len], priority) {
            self.flags.tx_overflow = false;
            Ok(len as u8)
        } else {
            self.flags.tx_overflow = true;
            self.counters.errors += 1;
            warn!(
                target: self.name.as_str(),
                "tx queue full, frame dropped [{}]", self.counters.errors
            );
            Err(Error::QueueFull)
        }
    }

    /// Open a transport session and announce `payload` to `dst` with an RTS.
    /// Returns the number of segments the payload will travel in.
    pub fn transport_send(&mut self, payload: &[u8], dst: u8) -> Result<u8, Error> {
        if !self.session.is_idle() {
            return Err(Error::TransportBusy);
        }
        let nbytes = payload.len();
        if nbytes < MIN_TRANSPORT_PAYLOAD || nbytes > 255 {
            return Err(Error::PayloadSize(nbytes));
        }
        let segments = Session::segments_for(nbytes);
        self.session.begin_tx(payload, dst, segments);
        let rts = [
            self.mid,
            PID_TRANSPORT_CONTROL,
            5,
            dst,
            CONTROL_RTS,
            segments,
            (nbytes & 0xff) as u8,
            (nbytes >> 8) as u8,
            0,
        ];
        self.send(&rts, rts.len() as u8, 8).ok();
        let now = self.hw.millis();
        self.session_timer.reset(now);
        trace!(
            target: self.name.as_str(),
            "transport tx to 0x{:02X}: {} bytes in {} segments", dst, nbytes, segments
        );
        Ok(segments)
    }

    /// Screen a source MID. Returns true when the frame may be forwarded
    /// and processed. A blocked MID that happens to be our own is a spoof
    /// and raises an alert.
    fn check_acl(&mut self, mid: u8) -> bool {
        if self.tx_transmitting {
            // this frame is our own transmission echoing back
            return false;
        }
        if !self.acl.is_blocked(mid) {
            return true;
        }
        if mid == self.mid {
            self.counters.security_alerts += 1;
            self.counters.errors += 1;
            self.counters.spoof += 1;
            self.pulse_security_led();
            let tally = self.detector.note_spoof(mid);
            if tally <= self.detector.spoof_limit {
                let alert = security::spoof_alert(self.mid, tally);
                self.send(&alert, alert.len() as u8, 8).ok();
            } else if tally == self.detector.spoof_limit + 1 {
                // persistent impersonation: escalate once to the rogue alarm
                self.detector.mark_rogue_self(mid);
                self.counters.rogue_self += 1;
                self.counters.errors += 1;
                self.counters.security_alerts += 1;
                self.pulse_security_led();
                warn!(
                    target: self.name.as_str(),
                    "spoofing of our MID passed the limit; rogue node assumed"
                );
            }
        }
        false
    }

    /// Two-phase dispatch gate. A frame's handler never runs in the tick
    /// that received it: the frame is classified now and acted on at the
    /// next quiet tick, with a cooldown after each handler so the reply
    /// traffic cannot retrigger us immediately.
    fn gate_dispatch(&mut self) {
        let now = self.hw.millis();
        if self.loop_timer.elapsed(now) > self.dispatch_period_ms {
            if self.pending.is_some() {
                self.dispatch_pending();
            } else {
                self.dispatch_period_ms = DISPATCH_RATE_MS;
                self.pending = self.parse();
            }
            self.loop_timer.reset(now);
        } else if self.pending.is_none() {
            self.pending = self.parse();
        }
    }

    fn dispatch_pending(&mut self) {
        if let Some(pdu) = self.pending.take() {
            trace!(target: self.name.as_str(), "dispatch {:?}", pdu);
            match pdu {
                TransportPdu::Rts => self.handle_rts(),
                TransportPdu::Cts => self.handle_cts(),
                TransportPdu::Eom => self.handle_eom(),
                TransportPdu::Abort => self.handle_abort(),
                TransportPdu::Cdp => self.handle_cdp(),
            }
            self.dispatch_period_ms = DISPATCH_COOLDOWN_MS;
        }
    }

    /// Classify the frame just received. Security alerts are acted on here,
    /// ahead of everything else; transport PDUs addressed to us come back as
    /// a pending handler for a later tick.
    fn parse(&mut self) -> Option<TransportPdu> {
        self.loop_buf.copy_from_slice(&self.rx_buf[..MAX_FRAME_LEN]);
        if self.loop_buf[2] == security::ALERT_MARKER[0]
            && self.loop_buf[3] == security::ALERT_MARKER[1]
            && self.loop_buf[4] == security::ALERT_MARKER[2]
        {
            self.handle_alert();
            return None;
        }
        if !self.gateway_processing {
            return None;
        }
        match self.loop_buf[2] {
            PID_TRANSPORT_CONTROL if self.loop_buf[4] == self.mid => match self.loop_buf[5] {
                CONTROL_RTS => Some(TransportPdu::Rts),
                CONTROL_CTS => Some(TransportPdu::Cts),
                CONTROL_EOM => Some(TransportPdu::Eom),
                CONTROL_ABORT => Some(TransportPdu::Abort),
                _ => None,
            },
            PID_TRANSPORT_DATA if self.loop_buf[4] == self.mid => Some(TransportPdu::Cdp),
            _ => None,
        }
    }

    /// A security alert arrived from another gateway. Spoof reports feed the
    /// tally; rogue reports are counted once per target and the target is
    /// blocked here too.
    fn handle_alert(&mut self) {
        let kind = self.loop_buf[6];
        let target = self.loop_buf[7];
        match kind {
            security::ALERT_KIND_SPOOF => {
                self.detector.note_spoof(target);
                self.counters.security_alerts += 1;
                self.counters.errors += 1;
                self.counters.spoof += 1;
                self.pulse_security_led();
            }
            security::ALERT_KIND_ROGUE_SELF => {
                if self.detector.mark_rogue_self(target) {
                    self.counters.security_alerts += 1;
                    self.counters.errors += 1;
                    self.counters.rogue_self += 1;
                    self.pulse_security_led();
                }
                self.acl.block(target);
            }
            security::ALERT_KIND_ROGUE_SHARED => {
                if self.detector.mark_rogue_shared(target) {
                    self.counters.security_alerts += 1;
                    self.counters.errors += 1;
                    self.counters.rogue_shared += 1;
                    self.pulse_security_led();
                }
                self.acl.block(target);
            }
            security::ALERT_KIND_ROGUE_HOST => {
                if self.detector.mark_rogue_host(target) {
                    self.counters.security_alerts += 1;
                    self.counters.errors += 1;
                    self.counters.rogue_host += 1;
                    self.pulse_security_led();
                }
                self.acl.block(target);
            }
            _ => {
                // malformed alert; nothing to act on
            }
        }
    }

    fn handle_rts(&mut self) {
        let peer = self.loop_buf[1];
        if !self.session.is_idle() {
            // busy with another session; refuse this one and keep ours
            self.send_abort(peer);
            return;
        }
        let segments = self.loop_buf[6];
        let nbytes = u16::from(self.loop_buf[7]) | (u16::from(self.loop_buf[8]) << 8);
        if segments == 0 || nbytes == 0 || nbytes as usize > MAX_TRANSPORT_PAYLOAD {
            // malformed, or more than the session buffer holds
            self.send_abort(peer);
            return;
        }
        let cts = [
            self.mid,
            PID_TRANSPORT_CONTROL,
            4,
            peer,
            CONTROL_CTS,
            segments,
            1,
            0,
        ];
        self.send(&cts, cts.len() as u8, 8).ok();
        self.session.begin_rx(peer, nbytes, segments);
        let now = self.hw.millis();
        self.session_timer.reset(now);
        trace!(
            target: self.name.as_str(),
            "rts from 0x{:02X}: {} bytes in {} segments", peer, nbytes, segments
        );
    }

    fn handle_cts(&mut self) {
        let peer = self.loop_buf[1];
        if !(self.session.tx_active() && peer == self.session.peer_mid) {
            // not in a session with this node
            self.send_abort(peer);
            return;
        }
        let requested = self.loop_buf[6];
        let start = self.loop_buf[7];
        if start == 0 || start > self.session.tx_nsegments || requested > self.session.tx_nsegments
        {
            // nonsensical relative to our RTS; end the session
            self.send_abort(peer);
            self.session.reset();
            return;
        }
        self.session.load_segments(self.mid, peer, start, requested);
        self.session.state = SessionState::TxSending;
        let now = self.hw.millis();
        self.session_timer.reset(now);
    }

    fn handle_cdp(&mut self) {
        let peer = self.loop_buf[1];
        if !(self.session.rx_active() && peer == self.session.peer_mid) {
            if self.session.rx_active() {
                self.session.reset();
            }
            self.send_abort(peer);
            return;
        }
        let data_len = (self.loop_buf[3].saturating_sub(2) as usize).min(SEGMENT_SIZE);
        let number = self.loop_buf[5];
        let stored = {
            let data = &self.loop_buf[6..6 + data_len];
            self.session.store_segment(number, data)
        };
        if !stored {
            self.session.reset();
            self.send_abort(peer);
            return;
        }
        let now = self.hw.millis();
        self.session_timer.reset(now);
        if number == self.session.rx_nsegments {
            let eom = [self.mid, PID_TRANSPORT_CONTROL, 2, peer, CONTROL_EOM, 0];
            self.send(&eom, eom.len() as u8, 8).ok();
            self.session.finish_rx();
            trace!(
                target: self.name.as_str(),
                "transport payload from 0x{:02X} complete", peer
            );
        }
    }

    fn handle_eom(&mut self) {
        let peer = self.loop_buf[1];
        if self.session.tx_active() && peer == self.session.peer_mid {
            self.session.reset();
            trace!(target: self.name.as_str(), "transport tx acknowledged");
        } else {
            // an end-of-message for a session we are not running
            self.send_abort(peer);
        }
    }

    fn handle_abort(&mut self) {
        let peer = self.loop_buf[1];
        if self.session.active() && peer == self.session.peer_mid {
            self.session.reset();
            trace!(target: self.name.as_str(), "session aborted by 0x{:02X}", peer);
        }
        // an abort for somebody else's session is not ours to act on
    }

    fn send_abort(&mut self, peer: u8) {
        let abort = [self.mid, PID_TRANSPORT_CONTROL, 2, peer, CONTROL_ABORT, 0];
        self.send(&abort, abort.len() as u8, 8).ok();
    }

    /// Transmit when the bus has been idle for the head frame's priority
    /// window plus any leaky-bucket penalty. Staged transport segments go
    /// out ahead of the general queue.
    fn arbitrate_tx(&mut self) {
        let now = self.hw.micros();
        let (priority, penalty) = {
            let queue = self.tx_queue.borrow();
            (queue.head_priority(), queue.penalty())
        };
        let wait = FRAME_GAP_US + ONE_BIT_US * u32::from(priority) * 2 + PENALTY_US * u32::from(penalty);
        if self.tx_timer.elapsed(now) <= wait {
            return;
        }
        let mut buf = [0u8; MAX_FRAME_LEN];
        if self.session.state == SessionState::TxSending {
            if let Some(len) = self.session.pop_segment(&mut buf) {
                self.transmit(&mut buf, len, true);
            }
            if self.session.segments_exhausted() {
                self.session.state = SessionState::TxAwaitingEom;
            }
        } else {
            let popped = self.tx_queue.borrow_mut().pop(&mut buf);
            if let Some((len, _)) = popped {
                self.transmit(&mut buf, len, true);
            }
        }
    }

    fn update_statistics(&mut self) {
        let now = self.hw.millis();
        if self.window_timer.elapsed(now) > WINDOW_MS {
            self.stats.roll_window();
            self.window_timer.reset(now);
            trace!(target: self.name.as_str(), "busload {:.3}", self.stats.busload());
        }
    }

    /// Periodic network health work: flood scanning, session expiry, the
    /// repeating rogue alarm and the security LED.
    fn check_network(&mut self) {
        let now = self.hw.millis();
        if self.scan_timer.elapsed(now) > FLOOD_SCAN_MS {
            if self.stats.busload() > self.detector.max_busload {
                self.counters.high_busload += 1;
                self.counters.errors += 1;
                self.flags.high_busload = true;
                if self.detector.note_high_busload() > self.detector.consecutive_max {
                    self.flood_scan();
                }
            } else {
                self.flags.high_busload = false;
                self.detector.clear_high_busload();
            }
            self.scan_timer.reset(now);
        }
        if self.session.active() && self.session_timer.elapsed(now) > SESSION_TIMEOUT_MS {
            // the peer went quiet; tear the session down on both ends
            let peer = self.session.peer_mid;
            self.session.reset();
            self.send_abort(peer);
            warn!(
                target: self.name.as_str(),
                "transport session with 0x{:02X} timed out", peer
            );
        }
        if self.detector.spoof_tally(self.mid) > self.detector.spoof_limit
            && self.rogue_timer.elapsed(now) > ROGUE_ALERT_INTERVAL_MS
        {
            let alert = security::rogue_self_alert(self.mid, self.counters.rogue_self as u8);
            self.send(&alert, alert.len() as u8, 3).ok();
            self.rogue_timer.reset(now);
        }
        self.update_security_led(now);
    }

    /// The bus has been overloaded for several scans running; block every
    /// MID holding more than its share and tell the neighbors.
    fn flood_scan(&mut self) {
        for mid in 0..=255u8 {
            if self.stats.share(mid) <= self.detector.max_mid_share {
                continue;
            }
            if self.host_port {
                if self.detector.mark_rogue_host(mid) {
                    self.counters.rogue_host += 1;
                    self.counters.errors += 1;
                    self.counters.security_alerts += 1;
                    self.pulse_security_led();
                    self.acl.block(mid);
                    // the flood is on our side of the link; warn the other
                    // segment, not the flooded one
                    if self.linked && self.forwarding {
                        if let Some(peer) = &self.peer_queue {
                            let alert = security::rogue_peer_alert(
                                self.mid,
                                security::ALERT_KIND_ROGUE_HOST,
                                mid,
                            );
                            peer.borrow_mut().push(&alert, 1);
                        }
                    }
                    warn!(
                        target: self.name.as_str(),
                        "flooding MID 0x{:02X} blocked (host net)", mid
                    );
                }
            } else if self.detector.mark_rogue_shared(mid) {
                self.counters.rogue_shared += 1;
                self.counters.errors += 1;
                self.counters.security_alerts += 1;
                self.pulse_security_led();
                self.acl.block(mid);
                let alert =
                    security::rogue_peer_alert(self.mid, security::ALERT_KIND_ROGUE_SHARED, mid);
                self.send(&alert, alert.len() as u8, 1).ok();
                warn!(
                    target: self.name.as_str(),
                    "flooding MID 0x{:02X} blocked (shared net)", mid
                );
            }
        }
    }

    fn log_frame(&self, len: u8) {
        let mut output = String::from("");
        for i in 1..=len as usize {
            output.push_str(format!("{:02X} ", self.rx_buf[i]).as_str());
        }
        debug!(
            target: self.name.as_str(),
            "SP{} [{}] {}", self.port_number, len, output.trim_end()
        );
    }

    fn toggle_rx_led(&mut self) {
        if self.rx_led_on {
            self.rx_led = !self.rx_led;
            self.hw.set_led(Led::Rx, self.rx_led);
        }
    }

    fn toggle_tx_led(&mut self) {
        if self.tx_led_on {
            self.tx_led = !self.tx_led;
            self.hw.set_led(Led::Tx, self.tx_led);
        }
    }

    fn pulse_security_led(&self) {
        if self.sec_led_on {
            self.hw.set_led(Led::Security, !self.sec_led);
        }
    }

    fn update_security_led(&mut self, now: u32) {
        if !self.sec_led_on {
            return;
        }
        let rogue_active = self.counters.rogue_self > 0
            || self.counters.rogue_shared > 0
            || self.counters.rogue_host > 0;
        if rogue_active {
            if self.led_timer.elapsed(now) > 1_000 {
                self.sec_led = !self.sec_led;
                self.hw.set_led(Led::Security, self.sec_led);
                self.led_timer.reset(now);
            }
        } else if self.counters.security_alerts > 0 && self.sec_led && self.led_timer.elapsed(now) > 500
        {
            self.sec_led = false;
            self.hw.set_led(Led::Security, false);
        }
    }
}

// Configuration and introspection surface; the text command console sits on
// top of these.
impl<'a, T> Port<'a, T>
where
    T: Interface,
{
    /// Change our MID. The new identifier is self-blocked so spoof
    /// detection keeps working; the old entry is left as configured.
    pub fn set_mid(&mut self, mid: u8) {
        self.mid = mid;
        self.acl.block(mid);
    }

    pub fn mid(&self) -> u8 {
        self.mid
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Mark this port as facing the protected host segment. Flood offenders
    /// found here are reported on the linked bus instead of the local one.
    pub fn set_host_port(&mut self, host: bool) {
        self.host_port = host;
    }

    pub fn set_forwarding(&mut self, on: bool) {
        self.forwarding = on;
    }

    /// Allow the engine to answer transport PDUs addressed to it. Off by
    /// default: a pure filter/forward node never engages the session layer.
    pub fn set_gateway_processing(&mut self, on: bool) {
        self.gateway_processing = on;
    }

    pub fn set_max_busload(&mut self, limit: f32) {
        self.detector.max_busload = limit;
    }

    pub fn set_max_mid_share(&mut self, limit: f32) {
        self.detector.max_mid_share = limit;
    }

    pub fn set_leds(&mut self, rx: bool, tx: bool, security: bool) {
        self.rx_led_on = rx;
        self.tx_led_on = tx;
        self.sec_led_on = security;
    }

    pub fn block_mid(&mut self, mid: u8) {
        self.acl.block(mid);
    }

    pub fn allow_mid(&mut self, mid: u8) {
        self.acl.allow(mid);
    }

    /// Reset the whole list to allow-all or block-all. Allow-all clears the
    /// self-MID entry too; spoof detection stays off until it is re-added.
    pub fn reset_acl(&mut self, blocked: bool) {
        self.acl.reset(blocked);
    }

    pub fn acl(&self) -> &Acl {
        &self.acl
    }

    /// Zero the message counters.
    pub fn reset_counters(&mut self) {
        self.counters.rx_frames = 0;
        self.counters.tx_frames = 0;
        self.counters.forwarded = 0;
    }

    /// Zero every error counter, flag and intrusion tracker.
    pub fn reset_errors(&mut self) {
        let rx_frames = self.counters.rx_frames;
        let tx_frames = self.counters.tx_frames;
        let forwarded = self.counters.forwarded;
        self.counters = Counters::default();
        self.counters.rx_frames = rx_frames;
        self.counters.tx_frames = tx_frames;
        self.counters.forwarded = forwarded;
        self.flags = ErrorFlags::default();
        self.detector.reset();
        self.tx_queue.borrow_mut().clear_overflows();
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn flags(&self) -> &ErrorFlags {
        &self.flags
    }

    pub fn busload(&self) -> f32 {
        self.stats.busload()
    }

    pub fn mid_share(&self, mid: u8) -> f32 {
        self.stats.share(mid)
    }

    /// The last frame the receiver completed, MID through checksum.
    pub fn rx_frame(&self) -> &[u8] {
        &self.rx_buf[1..=self.rx_len as usize]
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state
    }

    /// The last fully received transport payload.
    pub fn transport_received(&self) -> &[u8] {
        self.session.received()
    }

    pub fn queued_frames(&self) -> usize {
        self.tx_queue.borrow().len()
    }

    pub fn tx_penalty(&self) -> u8 {
        self.tx_queue.borrow().penalty()
    }

    /// Frames dropped because the transmit queue was full, the engine's own
    /// and forwarded traffic alike.
    pub fn tx_overflows(&self) -> u32 {
        self.tx_queue.borrow().overflows()
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    /// Whether a frame is partway through reception.
    pub fn rx_busy(&self) -> bool {
        self.rx_busy
    }

    /// Whether a transmission is in progress.
    pub fn tx_busy(&self) -> bool {
        self.tx_busy
    }
}
