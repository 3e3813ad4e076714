//! Per-MID access control list.
//!
//! One entry per possible source identifier; a blocked MID's frames are
//! dropped before forwarding or transport processing. The port's own MID is
//! kept blocked so that seeing it arrive from the wire is always an anomaly.

pub struct Acl {
    blocked: [bool; 256],
}

impl Acl {
    pub fn new() -> Self {
        Acl {
            blocked: [false; 256],
        }
    }

    pub fn block(&mut self, mid: u8) {
        self.blocked[mid as usize] = true;
    }

    pub fn allow(&mut self, mid: u8) {
        self.blocked[mid as usize] = false;
    }

    pub fn is_blocked(&self, mid: u8) -> bool {
        self.blocked[mid as usize]
    }

    /// Set every entry at once: block-all or allow-all.
    pub fn reset(&mut self, blocked: bool) {
        for entry in self.blocked.iter_mut() {
            *entry = blocked;
        }
    }

    /// MIDs currently blocked, ascending.
    pub fn blocked_mids(&self) -> Vec<u8> {
        (0..=255u8).filter(|mid| self.is_blocked(*mid)).collect()
    }
}
