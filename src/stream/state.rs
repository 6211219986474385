//! The streaming-engine state machine
//!
//! Everything that the ingest task and the HTTP task share lives here,
//! guarded by one session mutex: the reassembly ring, the playback
//! cursors and flags, the clock drift accumulators, the transcoder and
//! the ICY metadata. Methods are pure over `(state, now_ms)` and record
//! outbound work (resend spans, timing requests, the PLAY event) in a
//! [`SideEffects`] list so that no lock is ever held across a socket
//! operation.

use crate::codec::{AlacDecoder, Transcoder};
use crate::crypto::PacketDecryptor;
use crate::protocol::rtp::{AudioPacket, SyncPacket, TimingReply};

use super::clock::{
    GAP_COUNT, GAP_THRES, NTP_SYNC, SyncAnchor, SyncStatus, TimingClock, ms_to_ntp, ntp_delta_ms,
    ntp_to_ms,
};
use super::frame::{BUFFER_FRAMES, FrameBuffer, seq_order};

/// Per-slot resend requests are debounced by this many milliseconds.
pub(crate) const RESEND_TO: u32 = 200;

/// A FLUSH matching the last RECORD within this window is ignored.
const RECORD_FLUSH_WINDOW: u32 = 250;

/// ICY metadata pushed by the session layer.
#[derive(Debug, Clone, Default)]
pub struct StreamMetadata {
    /// Track artist
    pub artist: String,
    /// Track title
    pub title: String,
    /// Artwork URL, sent as `StreamURL`
    pub artwork: String,
}

/// Counters exposed to the session layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Frames recovered through resend requests
    pub resent_frames: u32,
    /// Frames replaced by silence because they never arrived
    pub silent_frames: u32,
    /// Synthetic frames inserted during the current underflow episode
    pub filled_frames: u32,
}

/// Marker left by the sender's RECORD command.
#[derive(Debug, Default)]
pub(crate) struct RecordMark {
    pub seqno: u16,
    pub rtptime: u32,
    pub time_ms: u32,
}

/// Outbound work collected under the lock, performed after it drops.
#[derive(Debug, Default)]
pub(crate) struct SideEffects {
    /// Inclusive resend spans for the control socket
    pub resends: Vec<(u16, u16)>,
    /// A timing request is due
    pub timing_request: bool,
    /// The PLAY event fired
    pub play: bool,
}

impl SideEffects {
    pub fn is_empty(&self) -> bool {
        self.resends.is_empty() && !self.timing_request && !self.play
    }
}

pub(crate) struct StreamState {
    pub buf: FrameBuffer,
    pub clock: TimingClock,
    pub sync: SyncAnchor,
    pub record: RecordMark,

    pub playing: bool,
    /// No non-silent frame decoded yet this play run
    pub silence: bool,
    pub pause: bool,
    pub http_ready: bool,
    pub flush_seqno: Option<u16>,

    pub skip: u32,
    pub silence_count: u32,
    pub filled_frames: u32,
    pub resent_frames: u32,
    pub silent_frames: u32,
    in_frames: u64,
    out_frames: u64,

    /// RTP hold depth in samples
    pub latency: u32,
    /// HTTP startup silence fill, in frames
    pub delay: u32,
    pub http_fill: bool,
    drift_compensation: bool,
    pub frame_size: usize,

    /// The HTTP task restarts its output position when it sees this
    pub restart_output: bool,

    pub metadata: StreamMetadata,
    pub icy_updated: bool,

    pub transcoder: Box<dyn Transcoder>,
    decryptor: Option<PacketDecryptor>,
    alac: Box<dyn AlacDecoder>,
    decrypt_buf: Vec<u8>,
    sync_count: u32,
}

impl StreamState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        frame_size: usize,
        latency: u32,
        delay: u32,
        http_fill: bool,
        drift_compensation: bool,
        sync_required: bool,
        decryptor: Option<PacketDecryptor>,
        alac: Box<dyn AlacDecoder>,
        transcoder: Box<dyn Transcoder>,
    ) -> Self {
        Self {
            buf: FrameBuffer::new(frame_size * 4),
            clock: TimingClock::default(),
            sync: SyncAnchor {
                required: sync_required,
                ..SyncAnchor::default()
            },
            record: RecordMark::default(),
            playing: false,
            silence: false,
            pause: false,
            http_ready: false,
            flush_seqno: None,
            skip: 0,
            silence_count: 0,
            filled_frames: 0,
            resent_frames: 0,
            silent_frames: 0,
            in_frames: 0,
            out_frames: 0,
            latency,
            delay,
            http_fill,
            drift_compensation,
            frame_size,
            restart_output: false,
            metadata: StreamMetadata::default(),
            icy_updated: false,
            transcoder,
            decryptor,
            alac,
            decrypt_buf: Vec::with_capacity(crate::protocol::rtp::MAX_PACKET),
            sync_count: 0,
        }
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            resent_frames: self.resent_frames,
            silent_frames: self.silent_frames,
            filled_frames: self.filled_frames,
        }
    }

    fn frame_bytes(&self) -> usize {
        self.frame_size * 4
    }

    fn start_play(&mut self, seqno: u16) {
        self.buf.ab_write = seqno.wrapping_sub(1);
        self.buf.ab_read = seqno;
        self.skip = 0;
        self.flush_seqno = None;
        self.playing = true;
        self.silence = true;
        self.sync.first = false;
        self.resent_frames = 0;
        self.silent_frames = 0;
        self.restart_output = true;
        self.transcoder.reset();
        tracing::info!(seqno, "playback starting");
    }

    /// Place a decoded packet into the ring, driving resend requests and
    /// the play-start gate.
    pub fn put_packet(&mut self, pkt: &AudioPacket<'_>, now: u32, fx: &mut SideEffects) {
        if !self.playing {
            let past_flush = self
                .flush_seqno
                .is_none_or(|flush| seq_order(flush, pkt.seqno));
            let sync_ok = !self.sync.required || self.sync.first;
            if past_flush && sync_ok {
                self.start_play(pkt.seqno);
            } else {
                return;
            }
        }

        // release the pause as soon as one recent frame is received
        if self.pause
            && self
                .flush_seqno
                .is_none_or(|flush| seq_order(flush, pkt.seqno))
        {
            self.pause = false;
        }

        let expected = self.buf.ab_write.wrapping_add(1);
        let slot_seq = if pkt.seqno == expected {
            self.buf.ab_write = pkt.seqno;
            Some(pkt.seqno)
        } else if seq_order(self.buf.ab_write, pkt.seqno) {
            // newer than expected: clamp the cursors, then ask for the gap
            let latency_frames = (self.latency / self.frame_size as u32) as u16;
            let gap = pkt.seqno.wrapping_sub(self.buf.ab_write).wrapping_sub(1);
            if self.latency != 0 && seq_order(latency_frames, gap) {
                tracing::warn!(missing = gap, "too many missing frames");
                self.buf.ab_write = pkt.seqno.wrapping_sub(latency_frames);
            }
            if self.delay != 0
                && seq_order(self.delay as u16, pkt.seqno.wrapping_sub(self.buf.ab_read))
            {
                tracing::warn!(
                    held = pkt.seqno.wrapping_sub(self.buf.ab_read).wrapping_add(1),
                    "on hold for too long"
                );
                self.buf.ab_read = pkt.seqno.wrapping_sub(self.delay as u16).wrapping_add(1);
            }

            let first = self.buf.ab_write.wrapping_add(1);
            let last = pkt.seqno.wrapping_sub(1);
            if self.queue_resend(first, last, fx) {
                let frame_size = self.frame_size as u32;
                let mut seq = first;
                while seq_order(seq, pkt.seqno) {
                    let back = u32::from(pkt.seqno.wrapping_sub(seq));
                    let slot = self.buf.slot_mut(seq);
                    slot.rtptime = pkt.rtptime.wrapping_sub(back * frame_size);
                    slot.last_resend = now;
                    seq = seq.wrapping_add(1);
                }
            }
            self.buf.ab_write = pkt.seqno;
            Some(pkt.seqno)
        } else if seq_order(self.buf.ab_read, pkt.seqno.wrapping_add(1)) {
            // recovered frame, not yet consumed
            tracing::debug!(seqno = pkt.seqno, "packet recovered");
            Some(pkt.seqno)
        } else {
            tracing::debug!(seqno = pkt.seqno, "packet too late");
            None
        };

        if self.in_frames & 0x1FF == 0 {
            tracing::info!(
                fill = self.buf.fill(),
                write = self.buf.ab_write,
                read = self.buf.ab_read,
                "ingest level"
            );
        }
        self.in_frames += 1;

        let Some(seq) = slot_seq else { return };

        let frame_bytes = self.frame_bytes();
        let decrypted: &[u8] = match &self.decryptor {
            Some(dec) => {
                dec.decrypt(pkt.payload, &mut self.decrypt_buf);
                &self.decrypt_buf
            }
            None => pkt.payload,
        };
        let slot = self.buf.slot_mut(seq);
        let non_silent = match self.alac.decode(decrypted, &mut slot.data) {
            Ok(len) => {
                slot.len = len.min(frame_bytes);
                slot.rtptime = pkt.rtptime;
                slot.ready = true;
                slot.data[..slot.len].iter().any(|&b| b != 0)
            }
            Err(e) => {
                tracing::warn!(seqno = seq, error = %e, "dropping undecodable packet");
                slot.ready = false;
                false
            }
        };

        if self.silence && non_silent {
            fx.play = true;
            self.silence = false;
        }
    }

    /// Apply a sync packet: capture the sender latency, re-anchor RTP
    /// time to local wall time, and request a timing exchange every four
    /// sync packets.
    pub fn on_sync(&mut self, sync: &SyncPacket, status: &SyncStatus, fx: &mut SideEffects) {
        if self.latency == 0 {
            self.latency = sync.rtp_now.wrapping_sub(sync.rtp_now_latency);
        }
        self.sync.rtp = sync.rtp_now.wrapping_sub(self.latency);
        self.sync.time_ms = self
            .clock
            .local_ms
            .wrapping_add(ntp_to_ms(sync.remote_ntp.wrapping_sub(self.clock.remote_ntp)) as u32);

        status.set(super::clock::RTP_SYNC);

        if sync.first {
            self.sync.first = true;
            tracing::info!("1st sync packet received");
        }

        if self.sync_count == 0 {
            fx.timing_request = true;
            self.sync_count = 3;
        } else {
            self.sync_count -= 1;
        }

        tracing::debug!(
            rtp = sync.rtp_now,
            latency = self.latency,
            time_ms = self.sync.time_ms,
            "sync packet"
        );
    }

    /// Apply a timing reply: update the NTP mapping and run the drift
    /// compensation window.
    pub fn on_timing(&mut self, reply: &TimingReply, now: u32, status: &SyncStatus) {
        let roundtrip = now.wrapping_sub(reply.reference);
        if roundtrip > 100 {
            tracing::warn!(roundtrip, "discarding NTP roundtrip");
            return;
        }

        // elapsed remote time should equal elapsed local time between the
        // two requests; what remains is drift
        let elapsed_local = u64::from(reply.reference.wrapping_sub(self.clock.local_ms));
        let expected = self.clock.remote_ntp.wrapping_add(ms_to_ntp(elapsed_local));

        self.clock.remote_ntp = reply.remote_ntp;
        self.clock.local_ms = reply.reference;
        self.clock.count += 1;

        if self.drift_compensation && status.contains(NTP_SYNC) {
            let delta = ntp_delta_ms(expected.wrapping_sub(reply.remote_ntp) as i64);
            self.clock.gap_sum += delta;

            if self.clock.gap_sum > GAP_THRES {
                let trips = self.clock.gap_count;
                self.clock.gap_count += 1;
                if trips > GAP_COUNT {
                    // our clock runs fast: we will starve, so replay one
                    // frame by stepping the read cursor back
                    tracing::info!(gap_sum = self.clock.gap_sum, "sending packets too fast");
                    self.buf.ab_read = self.buf.ab_read.wrapping_sub(1);
                    let read = self.buf.ab_read;
                    self.buf.slot_mut(read).ready = true;
                    self.clock.gap_sum -= GAP_THRES;
                    self.clock.gap_adjust -= GAP_THRES;
                }
            } else if self.clock.gap_sum < -GAP_THRES {
                let trips = self.clock.gap_count;
                self.clock.gap_count += 1;
                if trips > GAP_COUNT {
                    // our clock runs slow: drop one frame, or defer the
                    // drop when the ring is empty
                    if seq_order(self.buf.ab_read, self.buf.ab_write) {
                        let read = self.buf.ab_read;
                        self.buf.slot_mut(read).ready = false;
                        self.buf.ab_read = read.wrapping_add(1);
                    } else {
                        self.skip += 1;
                    }
                    self.clock.gap_sum += GAP_THRES;
                    self.clock.gap_adjust += GAP_THRES;
                    tracing::info!(
                        gap_sum = self.clock.gap_sum,
                        skip = self.skip,
                        "sending packets too slow"
                    );
                }
            }

            if self.clock.gap_sum.abs() < 8 {
                self.clock.gap_count = 0;
            }
        }

        status.set(NTP_SYNC);

        tracing::debug!(
            local = self.clock.local_ms,
            remote = self.clock.remote_ntp,
            gap_sum = self.clock.gap_sum,
            "timing reference"
        );
    }

    /// Pull the next output frame in wall-clock order into `out`.
    ///
    /// Returns `false` when nothing is ready; the caller should wait
    /// about two frame periods before retrying. Resend requests for
    /// blocking slots are queued into `fx`.
    pub fn pull_frame(
        &mut self,
        now: u32,
        status: &SyncStatus,
        fx: &mut SideEffects,
        out: &mut Vec<u8>,
    ) -> bool {
        out.clear();

        if !self.playing {
            return false;
        }

        // startup buffering and pause both emit silence
        if self.silence_count > 0 || self.pause {
            if self.silence_count > 0 {
                self.silence_count -= 1;
            }
            out.resize(self.frame_bytes(), 0);
            return true;
        }

        // skips requested by drift correction that could not run in sync
        while self.skip > 0 && seq_order(self.buf.ab_read, self.buf.ab_write) {
            let read = self.buf.ab_read;
            self.buf.slot_mut(read).ready = false;
            self.buf.ab_read = read.wrapping_add(1);
            self.skip -= 1;
            tracing::info!(skip = self.skip, "dropping frame to keep alignment");
        }

        let mut fill = self.buf.fill();
        if fill >= BUFFER_FRAMES as i16 {
            tracing::error!(fill, "buffer overrun");
            fill = self.buf.rebase_after_overrun();
        }

        let cur_seq = self.buf.ab_read;

        // an empty ring replays the previous timeline position
        if fill == 0 {
            let prev_rtptime = self.buf.slot(cur_seq.wrapping_sub(1)).rtptime;
            self.buf.slot_mut(cur_seq).rtptime =
                prev_rtptime.wrapping_add(self.frame_size as u32);
        }

        let cur_rtptime = self.buf.slot(cur_seq).rtptime;
        let cur_ready = self.buf.slot(cur_seq).ready;

        let offset_ms =
            (i64::from(cur_rtptime.wrapping_sub(self.sync.rtp) as i32) * 1000 / 44100) as i32;
        let playtime = self.sync.time_ms.wrapping_add(offset_ms as u32);
        let early = (playtime.wrapping_sub(now) as i32) > 0;

        // wait if not ready but still on time, otherwise send silence
        if (fill == 0 && !self.http_fill) || !status.is_complete() || (early && !cur_ready) {
            // catch-up resends for blocking frames at the head
            let window = (fill.max(0) as u16).min(16);
            for i in 0..window {
                let seq = cur_seq.wrapping_add(i);
                if !self.buf.slot(seq).ready
                    && now.wrapping_sub(self.buf.slot(seq).last_resend) > RESEND_TO
                    && self.queue_resend(seq, seq, fx)
                {
                    self.buf.slot_mut(seq).last_resend = now;
                }
            }
            return false;
        }

        // synthetic silence at the head moves the write cursor with us
        if fill == 0 {
            if self.filled_frames == 0 {
                tracing::warn!(
                    late = now.wrapping_sub(playtime),
                    "start of silence fill"
                );
            }
            self.buf.ab_write = self.buf.ab_write.wrapping_add(1);
            self.filled_frames += 1;
        } else {
            self.filled_frames = 0;
        }

        if self.out_frames & 0x1FF == 0 {
            tracing::info!(
                fill = fill - 1,
                gap = playtime.wrapping_sub(now) as i32,
                resent = self.resent_frames,
                silent = self.silent_frames,
                filled = self.filled_frames,
                "drain level"
            );
        }
        self.out_frames += 1;

        // each missing frame further out is re-requested at most every
        // RESEND_TO ms, sampled every 16 slots
        let mut i = 16u16;
        while seq_order(cur_seq.wrapping_add(i), self.buf.ab_write) {
            let seq = cur_seq.wrapping_add(i);
            if !self.buf.slot(seq).ready
                && now.wrapping_sub(self.buf.slot(seq).last_resend) > RESEND_TO
                && self.queue_resend(seq, seq, fx)
            {
                self.buf.slot_mut(seq).last_resend = now;
            }
            i += 16;
        }

        let frame_bytes = self.frame_bytes();
        let slot = self.buf.slot_mut(cur_seq);
        if !slot.ready {
            tracing::debug!(seqno = cur_seq, "created zero frame");
            slot.data[..frame_bytes].fill(0);
            slot.len = frame_bytes;
            self.silent_frames += 1;
        }

        let slot = self.buf.slot_mut(cur_seq);
        out.extend_from_slice(&slot.data[..slot.len]);
        slot.ready = false;
        self.buf.ab_read = cur_seq.wrapping_add(1);

        true
    }

    /// Prime the startup silence countdown for a fresh HTTP consumer.
    pub fn prime_http_connect(&mut self) {
        self.silence_count = self.delay;
        if self.playing {
            let fill = self.buf.fill();
            if fill > 0 {
                self.silence_count -= self.silence_count.min(fill as u32);
            } else {
                self.silence_count = 0;
            }
        }
    }

    /// Record marker from the sender's RECORD command.
    pub fn record(&mut self, seqno: u16, rtptime: u32, now: u32) {
        self.record = RecordMark {
            seqno,
            rtptime,
            time_ms: now,
        };
        tracing::info!(seqno, rtptime, "record");
    }

    /// Flush the stream at `seqno`. With `silence` the session keeps
    /// playing and emits silence until newer data arrives; without it
    /// playback stops until the next play run. Returns `false` when the
    /// flush duplicates the last RECORD and is ignored.
    pub fn flush(&mut self, seqno: u16, rtptime: u32, silence: bool, now: u32) -> bool {
        if now.wrapping_sub(self.record.time_ms) < RECORD_FLUSH_WINDOW
            || (self.record.seqno == seqno && self.record.rtptime == rtptime)
        {
            tracing::error!(seqno, rtptime, "FLUSH ignored as same as RECORD");
            return false;
        }

        self.buf.reset();
        self.flush_seqno = Some(seqno);
        if silence {
            self.pause = true;
        } else {
            self.playing = false;
            self.sync.first = false;
            self.http_ready = false;
        }

        tracing::info!(seqno, rtptime, silence, "flush");
        true
    }

    /// Store new ICY metadata; the next metadata boundary emits it.
    pub fn set_metadata(&mut self, metadata: StreamMetadata) {
        self.metadata = metadata;
        self.icy_updated = true;
    }

    /// Queue a resend for the inclusive span, refusing silly ranges that
    /// show up after long network blackouts.
    fn queue_resend(&mut self, first: u16, last: u16, fx: &mut SideEffects) -> bool {
        if seq_order(last, first) || last.wrapping_sub(first) > (BUFFER_FRAMES as u16) / 2 {
            return false;
        }
        self.resent_frames += u32::from(last.wrapping_sub(first)) + 1;
        fx.resends.push((first, last));
        tracing::debug!(first, last, "resend request");
        true
    }
}
