#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use j1708_rs::{Interface, Port};

/// Mock half-duplex UART with a hand-cranked clock.
///
/// Written bytes land on `wire` for inspection; with `echo` on they also
/// reappear on the receive side, the way the real transceiver loops the line
/// back. Arming `collide_with` makes the next write echo a different byte
/// instead, simulating a lost arbitration.
pub struct Uart {
    pub rx: RefCell<VecDeque<u8>>,
    pub wire: RefCell<Vec<u8>>,
    pub clock_us: Cell<u32>,
    pub echo: Cell<bool>,
    pub collide_with: Cell<Option<u8>>,
    /// Advance the clock this much on every `micros` reading so bounded
    /// busy-waits make progress when nothing else moves time forward.
    pub auto_tick_us: Cell<u32>,
}

impl Uart {
    pub fn new(echo: bool) -> Self {
        Uart {
            rx: RefCell::new(VecDeque::new()),
            wire: RefCell::new(Vec::new()),
            clock_us: Cell::new(0),
            echo: Cell::new(echo),
            collide_with: Cell::new(None),
            auto_tick_us: Cell::new(0),
        }
    }

    pub fn advance_us(&self, us: u32) {
        self.clock_us.set(self.clock_us.get().wrapping_add(us));
    }

    pub fn advance_ms(&self, ms: u32) {
        self.advance_us(ms * 1_000);
    }

    pub fn feed(&self, bytes: &[u8]) {
        for byte in bytes {
            self.rx.borrow_mut().push_back(*byte);
        }
    }

    pub fn written(&self) -> Vec<u8> {
        self.wire.borrow().clone()
    }

    pub fn clear_written(&self) {
        self.wire.borrow_mut().clear();
    }
}

impl Interface for Uart {
    fn read(&self) -> Option<u8> {
        self.rx.borrow_mut().pop_front()
    }

    fn peek(&self) -> Option<u8> {
        self.rx.borrow().front().copied()
    }

    fn available(&self) -> bool {
        !self.rx.borrow().is_empty()
    }

    fn write(&self, byte: u8) {
        self.wire.borrow_mut().push(byte);
        if let Some(other) = self.collide_with.get() {
            self.rx.borrow_mut().push_back(other);
            self.collide_with.set(None);
        } else if self.echo.get() {
            self.rx.borrow_mut().push_back(byte);
        }
    }

    fn micros(&self) -> u32 {
        let now = self.clock_us.get().wrapping_add(self.auto_tick_us.get());
        self.clock_us.set(now);
        now
    }

    fn millis(&self) -> u32 {
        self.clock_us.get() / 1_000
    }
}

/// Push a whole frame through the port one byte per tick, then the closing
/// inter-frame gap.
pub fn deliver(port: &mut Port<Uart>, uart: &Uart, frame: &[u8]) {
    for byte in frame {
        uart.rx.borrow_mut().push_back(*byte);
        port.update();
    }
    uart.advance_us(1_300);
    port.update();
}

/// Give the port a long-enough idle window to win arbitration once, then
/// swallow whatever echoed back so the line ends quiet.
pub fn flush_tx(port: &mut Port<Uart>, uart: &Uart) {
    uart.advance_us(4_000);
    port.update();
    while uart.available() {
        port.update();
    }
    uart.advance_us(1_300);
    port.update();
}

/// A frame with its checksum byte filled in.
pub fn framed(body_and_slot: &[u8]) -> Vec<u8> {
    let mut frame = body_and_slot.to_vec();
    j1708_rs::checksum::append(&mut frame);
    frame
}
