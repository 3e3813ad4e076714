//! J1708 frame checksum.
//!
//! The last byte of every frame is the two's complement of the modulo-256 sum
//! of the bytes before it, so a whole valid frame sums to zero.

/// Wrapping sum of a byte run.
pub fn sum(bytes: &[u8]) -> u8 {
    let mut acc: u8 = 0;
    for byte in bytes {
        acc = acc.wrapping_add(*byte);
    }
    acc
}

/// Checksum value for a frame body (everything before the checksum byte).
pub fn compute(body: &[u8]) -> u8 {
    (!sum(body)).wrapping_add(1)
}

/// Overwrite the last byte of `frame` with the checksum of the rest.
pub fn append(frame: &mut [u8]) {
    let last = frame.len() - 1;
    frame[last] = compute(&frame[..last]);
}

/// A complete frame is valid when it sums to zero.
pub fn verify(frame: &[u8]) -> bool {
    sum(frame) == 0
}
