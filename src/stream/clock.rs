//! Sender/receiver clock bookkeeping
//!
//! Two clocks rule playback: the NTP-style timing exchange maps the
//! sender's 64-bit NTP time onto our millisecond tick, and sync packets
//! anchor RTP timestamps to that mapping. Drift between the two hosts is
//! absorbed by inserting or dropping one frame per accumulated
//! [`GAP_THRES`] window.

use std::sync::atomic::{AtomicU8, Ordering};

/// Drift threshold in milliseconds; one frame is inserted or dropped per
/// crossed window.
pub const GAP_THRES: i64 = 8;
/// Exchanges a gap must persist before a frame adjustment happens.
pub const GAP_COUNT: u32 = 20;

/// Status bit: RTP anchor established by a sync packet.
pub const RTP_SYNC: u8 = 0x01;
/// Status bit: NTP mapping established by a timing reply.
pub const NTP_SYNC: u8 = 0x02;

/// NTP (32.32 fixed point) to milliseconds, rounded so the conversion
/// round-trips exactly at millisecond granularity.
#[inline]
#[must_use]
pub fn ntp_to_ms(ntp: u64) -> u64 {
    (((ntp >> 10) * 1000) + (1 << 21)) >> 22
}

/// Milliseconds to NTP 32.32 fixed point.
#[inline]
#[must_use]
pub fn ms_to_ntp(ms: u64) -> u64 {
    ((ms << 22) / 1000) << 10
}

/// Signed NTP difference to milliseconds (arithmetic shifts).
#[inline]
#[must_use]
pub fn ntp_delta_ms(ntp: i64) -> i64 {
    ((ntp >> 10) * 1000) >> 22
}

/// State of the NTP-style timing exchange with the sender.
#[derive(Debug, Default)]
pub(crate) struct TimingClock {
    /// Our millisecond tick when the last accepted request was sent
    pub local_ms: u32,
    /// Sender NTP value reported for that request
    pub remote_ntp: u64,
    /// Accepted exchanges
    pub count: u32,
    /// Accumulated expected-vs-observed remote time, in ms
    pub gap_sum: i64,
    /// Total drift absorbed so far, in ms
    pub gap_adjust: i64,
    /// Consecutive exchanges with the gap outside the threshold
    pub gap_count: u32,
}

/// Mapping from RTP timestamps to local wall time, set by sync packets.
#[derive(Debug, Default)]
pub(crate) struct SyncAnchor {
    /// RTP timestamp that plays at `time_ms`
    pub rtp: u32,
    /// Local millisecond tick at which `rtp` should play
    pub time_ms: u32,
    /// A restart-flagged sync packet has been seen
    pub first: bool,
    /// Playback may not start before the restart flag is seen
    pub required: bool,
}

/// Atomic RTP/NTP sync status bits, written by the ingest task and read
/// by the playback puller.
#[derive(Debug, Default)]
pub(crate) struct SyncStatus(AtomicU8);

impl SyncStatus {
    pub fn set(&self, bit: u8) {
        self.0.fetch_or(bit, Ordering::Relaxed);
    }

    pub fn contains(&self, bit: u8) -> bool {
        self.0.load(Ordering::Relaxed) & bit != 0
    }

    /// Playback requires both anchors.
    pub fn is_complete(&self) -> bool {
        self.0.load(Ordering::Relaxed) == (RTP_SYNC | NTP_SYNC)
    }
}
