//! RTP ingest task
//!
//! Owns the three UDP sockets of the session (data, control, timing),
//! dispatches inbound packets into the state machine, and performs the
//! outbound work the state machine queued, always after the session
//! lock has been dropped.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::sleep;

use crate::protocol::rtp::{self, MAX_PACKET, RtpPacket};

use super::state::SideEffects;
use super::{Shared, StreamerEvent};

const SELECT_TICK: Duration = Duration::from_millis(50);

/// Outbound side of the RTP session: the control and timing sockets,
/// the configured peer, and the source address learned from inbound
/// packets when no peer was configured.
pub(crate) struct RtpLink {
    pub control: Arc<UdpSocket>,
    pub timing: Arc<UdpSocket>,
    control_rport: u16,
    timing_rport: u16,
    peer: Option<IpAddr>,
    rtp_source: StdMutex<Option<IpAddr>>,
    resend_seq: AtomicU16,
}

impl RtpLink {
    pub fn new(
        control: Arc<UdpSocket>,
        timing: Arc<UdpSocket>,
        control_rport: u16,
        timing_rport: u16,
        peer: Option<IpAddr>,
    ) -> Self {
        Self {
            control,
            timing,
            control_rport,
            timing_rport,
            peer,
            rtp_source: StdMutex::new(None),
            resend_seq: AtomicU16::new(0),
        }
    }

    /// Remember where the sender transmits from; used as the request
    /// target when no peer address was configured.
    pub fn note_source(&self, src: SocketAddr) {
        *self
            .rtp_source
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(src.ip());
    }

    fn source(&self) -> Option<IpAddr> {
        *self
            .rtp_source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a timing request. Returns `false` when no target address is
    /// known yet (the request is retried once packets arrive).
    pub async fn request_timing(&self, now_ms: u32) -> bool {
        let Some(ip) = self.peer.or_else(|| self.source()) else {
            return false;
        };
        let req = rtp::timing_request(now_ms);
        if let Err(e) = self
            .timing
            .send_to(&req, SocketAddr::new(ip, self.timing_rport))
            .await
        {
            tracing::warn!(error = %e, "timing request send failed");
        }
        true
    }

    /// Send a resend request for the inclusive span on the control
    /// socket.
    pub async fn request_resend(&self, first: u16, last: u16) {
        let Some(ip) = self.source().or(self.peer) else {
            return;
        };
        let seq = self.resend_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let count = last.wrapping_sub(first).wrapping_add(1);
        let req = rtp::resend_request(seq, first, count);
        if let Err(e) = self
            .control
            .send_to(&req, SocketAddr::new(ip, self.control_rport))
            .await
        {
            tracing::warn!(error = %e, "resend request send failed");
        }
    }
}

/// Perform the outbound work queued by a state transition. Must only be
/// called after the session lock has been dropped.
pub(crate) async fn apply_effects(shared: &Shared, link: &RtpLink, fx: &mut SideEffects) {
    for (first, last) in fx.resends.drain(..) {
        link.request_resend(first, last).await;
    }
    if fx.timing_request {
        fx.timing_request = false;
        link.request_timing(shared.now_ms()).await;
    }
    if fx.play {
        fx.play = false;
        if let Some(event) = &shared.hooks.event {
            event(StreamerEvent::Play);
        }
    }
}

/// The ingest loop: select across the three sockets with a 50 ms tick so
/// `running = false` is honored within one tick.
pub(crate) async fn rtp_task(shared: Arc<Shared>, link: Arc<RtpLink>, data: Arc<UdpSocket>) {
    // initial synchronization burst
    let mut ntp_sent = false;
    for _ in 0..3 {
        ntp_sent = link.request_timing(shared.now_ms()).await;
    }

    let mut fx = SideEffects::default();
    let mut data_buf = [0u8; MAX_PACKET];
    let mut control_buf = [0u8; MAX_PACKET];
    let mut timing_buf = [0u8; MAX_PACKET];

    while shared.is_running() {
        let received = tokio::select! {
            r = data.recv_from(&mut data_buf) => r.ok().map(|(n, src)| (0usize, n, src)),
            r = link.control.recv_from(&mut control_buf) => r.ok().map(|(n, src)| (1usize, n, src)),
            r = link.timing.recv_from(&mut timing_buf) => r.ok().map(|(n, src)| (2usize, n, src)),
            () = sleep(SELECT_TICK) => None,
        };

        let Some((which, len, src)) = received else {
            continue;
        };
        let packet = match which {
            0 => &data_buf[..len],
            1 => &control_buf[..len],
            _ => &timing_buf[..len],
        };

        link.note_source(src);

        if !ntp_sent {
            tracing::warn!("NTP request not sent yet");
            ntp_sent = link.request_timing(shared.now_ms()).await;
        }

        match rtp::parse(packet) {
            Some(RtpPacket::Audio(pkt)) => {
                if pkt.first {
                    tracing::info!("1st audio packet received");
                }
                let now = shared.now_ms();
                shared.lock_state().put_packet(&pkt, now, &mut fx);
            }
            Some(RtpPacket::Sync(sync)) => {
                shared.lock_state().on_sync(&sync, &shared.status, &mut fx);
            }
            Some(RtpPacket::TimingReply(reply)) => {
                let now = shared.now_ms();
                shared.lock_state().on_timing(&reply, now, &shared.status);
            }
            None => {}
        }

        if !fx.is_empty() {
            apply_effects(&shared, &link, &mut fx).await;
        }
    }

    tracing::info!("rtp ingest terminating");
}
