//! The circular reassembly buffer of decoded PCM frames
//!
//! Sequence numbers wrap every 65536 packets, so ordering is always
//! judged through [`seq_order`]; raw comparison of sequence values is
//! never valid.

/// Slots in the reassembly ring.
pub const BUFFER_FRAMES: usize = 1024;

/// On overrun, the read cursor is rebased this many slots behind write.
const OVERRUN_HEADROOM: u16 = 64;

/// Modular sequence ordering: true when `b` comes after `a`.
#[inline]
#[must_use]
pub fn seq_order(a: u16, b: u16) -> bool {
    (b.wrapping_sub(a) as i16) > 0
}

/// One decoded audio packet slot, reused modulo the ring size.
pub(crate) struct Frame {
    /// Decoded and not yet consumed
    pub ready: bool,
    /// Sender timestamp at which this block should play
    pub rtptime: u32,
    /// Local millisecond tick of the last resend request for this slot
    pub last_resend: u32,
    /// Decoded byte length
    pub len: usize,
    /// PCM payload, allocated once at startup
    pub data: Vec<u8>,
}

/// Fixed ring of [`BUFFER_FRAMES`] frames indexed by `seq % BUFFER_FRAMES`.
///
/// `ab_write` is the last accepted sequence, `ab_read` the next to emit,
/// so the fill level is `ab_write - ab_read + 1` in signed 16-bit
/// arithmetic.
pub(crate) struct FrameBuffer {
    frames: Vec<Frame>,
    pub ab_read: u16,
    pub ab_write: u16,
}

impl FrameBuffer {
    /// Preallocate every slot with `frame_bytes` of payload.
    pub fn new(frame_bytes: usize) -> Self {
        let frames = (0..BUFFER_FRAMES)
            .map(|_| Frame {
                ready: false,
                rtptime: 0,
                last_resend: 0,
                len: 0,
                data: vec![0; frame_bytes],
            })
            .collect();
        Self {
            frames,
            ab_read: 1,
            ab_write: 0,
        }
    }

    pub fn slot(&self, seq: u16) -> &Frame {
        &self.frames[seq as usize % BUFFER_FRAMES]
    }

    pub fn slot_mut(&mut self, seq: u16) -> &mut Frame {
        &mut self.frames[seq as usize % BUFFER_FRAMES]
    }

    /// Signed fill level; negative when the cursors have not met yet.
    pub fn fill(&self) -> i16 {
        self.ab_write.wrapping_sub(self.ab_read).wrapping_add(1) as i16
    }

    /// Drop all buffered audio, keeping the cursors.
    pub fn reset(&mut self) {
        for frame in &mut self.frames {
            frame.ready = false;
        }
    }

    /// Rebase the read cursor after an overrun and return the new fill.
    pub fn rebase_after_overrun(&mut self) -> i16 {
        self.ab_read = self
            .ab_write
            .wrapping_sub(BUFFER_FRAMES as u16 - OVERRUN_HEADROOM);
        self.fill()
    }
}
