//! AirTunes RTP wire formats
//!
//! The sender speaks the Apple variant of RTP: the first byte is ignored
//! except for bit 4 of a sync packet, and the packet type is the second
//! byte masked with `0x7F`. Four inbound packet types matter here:
//! audio data (`0x60`), resend replies (`0x56`, a data packet behind a
//! 4-byte shim), sync (`0x54`) and timing replies (`0x53`), plus two
//! outbound requests built by this module.

use byteorder::{BigEndian, ByteOrder};

/// Largest datagram we accept on any RTP socket.
pub const MAX_PACKET: usize = 2048;

/// Apple packet type bytes (second byte `& 0x7F`).
pub mod types {
    /// NTP-style timing request (receiver → sender)
    pub const TIMING_REQUEST: u8 = 0x52;
    /// NTP-style timing reply (sender → receiver)
    pub const TIMING_REPLY: u8 = 0x53;
    /// RTP/NTP sync mapping (sender → receiver)
    pub const SYNC: u8 = 0x54;
    /// Resend request (receiver → sender, control channel)
    pub const RESEND_REQUEST: u8 = 0x55;
    /// Resend reply (sender → receiver, shimmed data packet)
    pub const RESEND_REPLY: u8 = 0x56;
    /// Audio data
    pub const DATA: u8 = 0x60;
}

/// A parsed audio data packet (either a live `0x60` or a `0x56` resend
/// reply with the shim stripped). `payload` is the encrypted ALAC body.
#[derive(Debug, Clone, Copy)]
pub struct AudioPacket<'a> {
    /// 16-bit RTP sequence number
    pub seqno: u16,
    /// Sender timestamp at which this block should play
    pub rtptime: u32,
    /// Set on the first audio packet of a play-run
    pub first: bool,
    /// Encrypted codec payload
    pub payload: &'a [u8],
}

/// A parsed `0x54` sync packet mapping RTP time to sender NTP time.
#[derive(Debug, Clone, Copy)]
pub struct SyncPacket {
    /// RTP timestamp minus the sender-chosen latency
    pub rtp_now_latency: u32,
    /// Sender NTP time of the mapping
    pub remote_ntp: u64,
    /// RTP timestamp "now" on the sender
    pub rtp_now: u32,
    /// Bit 4 of the first byte: playback (re)start marker
    pub first: bool,
}

/// A parsed `0x53` timing reply.
#[derive(Debug, Clone, Copy)]
pub struct TimingReply {
    /// Echo of the millisecond tick we put in the request
    pub reference: u32,
    /// Sender NTP time when the reply was sent
    pub remote_ntp: u64,
}

/// Any inbound packet this receiver cares about.
#[derive(Debug, Clone, Copy)]
pub enum RtpPacket<'a> {
    /// Audio data or recovered resend
    Audio(AudioPacket<'a>),
    /// RTP/NTP sync mapping
    Sync(SyncPacket),
    /// Timing exchange reply
    TimingReply(TimingReply),
}

/// Parse one datagram. Returns `None` for unknown types, truncated
/// packets, and audio bodies too short to hold a cipher block.
#[must_use]
pub fn parse(packet: &[u8]) -> Option<RtpPacket<'_>> {
    if packet.len() < 8 {
        return None;
    }

    match packet[1] & 0x7F {
        // resend replies carry a 4-byte shim in front of a data packet
        types::RESEND_REPLY => parse_audio(packet.get(4..)?, false),
        types::DATA => parse_audio(packet, packet[1] & 0x80 != 0),
        types::SYNC => {
            if packet.len() < 20 {
                return None;
            }
            Some(RtpPacket::Sync(SyncPacket {
                rtp_now_latency: be_u32(&packet[4..8]),
                remote_ntp: be_u64(&packet[8..16]),
                rtp_now: be_u32(&packet[16..20]),
                first: packet[0] & 0x10 != 0,
            }))
        }
        types::TIMING_REPLY => {
            if packet.len() < 24 {
                return None;
            }
            Some(RtpPacket::TimingReply(TimingReply {
                reference: be_u32(&packet[12..16]),
                remote_ntp: be_u64(&packet[16..24]),
            }))
        }
        _ => None,
    }
}

fn parse_audio(pkt: &[u8], first: bool) -> Option<RtpPacket<'_>> {
    // 12-byte header plus at least one AES block of body
    if pkt.len() < 12 + 16 {
        return None;
    }
    Some(RtpPacket::Audio(AudioPacket {
        seqno: u16::from_be_bytes([pkt[2], pkt[3]]),
        rtptime: be_u32(&pkt[4..8]),
        first,
        payload: &pkt[12..],
    }))
}

/// Build the 32-byte timing request. The final four bytes carry our
/// millisecond tick; the reply echoes it back as `reference`.
#[must_use]
pub fn timing_request(now_ms: u32) -> [u8; 32] {
    let mut req = [0u8; 32];
    req[0] = 0x80;
    req[1] = types::TIMING_REQUEST | 0x80;
    req[2..4].copy_from_slice(&7u16.to_be_bytes());
    req[28..32].copy_from_slice(&now_ms.to_be_bytes());
    req
}

/// Build the 8-byte resend request for `count` frames starting at
/// `first`. Not a standard RTCP NACK.
#[must_use]
pub fn resend_request(request_seq: u16, first: u16, count: u16) -> [u8; 8] {
    let mut req = [0u8; 8];
    req[0] = 0x80;
    req[1] = types::RESEND_REQUEST | 0x80;
    req[2..4].copy_from_slice(&request_seq.to_be_bytes());
    req[4..6].copy_from_slice(&first.to_be_bytes());
    req[6..8].copy_from_slice(&count.to_be_bytes());
    req
}

fn be_u32(b: &[u8]) -> u32 {
    BigEndian::read_u32(b)
}

fn be_u64(b: &[u8]) -> u64 {
    BigEndian::read_u64(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_packet(ty: u8, marker: bool, seqno: u16, rtptime: u32, body: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0x80, if marker { ty | 0x80 } else { ty }];
        pkt.extend_from_slice(&seqno.to_be_bytes());
        pkt.extend_from_slice(&rtptime.to_be_bytes());
        pkt.extend_from_slice(&[0u8; 4]); // ssrc
        pkt.extend_from_slice(body);
        pkt
    }

    #[test]
    fn test_parse_data_packet() {
        let pkt = audio_packet(types::DATA, true, 42, 123_456, &[0xAA; 32]);
        match parse(&pkt) {
            Some(RtpPacket::Audio(a)) => {
                assert_eq!(a.seqno, 42);
                assert_eq!(a.rtptime, 123_456);
                assert!(a.first);
                assert_eq!(a.payload, &[0xAA; 32]);
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn test_parse_resend_reply_strips_shim() {
        let inner = audio_packet(types::DATA, true, 7, 99, &[0x11; 16]);
        let mut pkt = vec![0x80, types::RESEND_REPLY | 0x80, 0, 0];
        pkt.extend_from_slice(&inner);
        match parse(&pkt) {
            Some(RtpPacket::Audio(a)) => {
                assert_eq!(a.seqno, 7);
                assert_eq!(a.rtptime, 99);
                // the marker of the inner packet is not a play-run start
                assert!(!a.first);
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_short_audio_body() {
        let pkt = audio_packet(types::DATA, false, 1, 1, &[0u8; 15]);
        assert!(parse(&pkt).is_none());
    }

    #[test]
    fn test_parse_sync_packet() {
        let mut pkt = vec![0x90, types::SYNC | 0x80, 0, 4];
        pkt.extend_from_slice(&1000u32.to_be_bytes());
        pkt.extend_from_slice(&0x0011_2233_4455_6677u64.to_be_bytes());
        pkt.extend_from_slice(&12_000u32.to_be_bytes());
        match parse(&pkt) {
            Some(RtpPacket::Sync(s)) => {
                assert_eq!(s.rtp_now_latency, 1000);
                assert_eq!(s.remote_ntp, 0x0011_2233_4455_6677);
                assert_eq!(s.rtp_now, 12_000);
                assert!(s.first); // bit 4 of byte 0
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn test_parse_timing_reply() {
        let mut pkt = vec![0x80, types::TIMING_REPLY | 0x80, 0, 7];
        pkt.extend_from_slice(&[0u8; 8]); // padding + originate high bits
        pkt.extend_from_slice(&55_555u32.to_be_bytes());
        pkt.extend_from_slice(&0xAABB_CCDD_EEFF_0011u64.to_be_bytes());
        match parse(&pkt) {
            Some(RtpPacket::TimingReply(t)) => {
                assert_eq!(t.reference, 55_555);
                assert_eq!(t.remote_ntp, 0xAABB_CCDD_EEFF_0011);
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn test_parse_unknown_type() {
        let pkt = audio_packet(0x61, false, 0, 0, &[0u8; 32]);
        assert!(parse(&pkt).is_none());
    }

    #[test]
    fn test_timing_request_layout() {
        let req = timing_request(0xDEAD_BEEF);
        assert_eq!(req.len(), 32);
        assert_eq!(req[0], 0x80);
        assert_eq!(req[1], 0xD2);
        assert_eq!(&req[2..4], &7u16.to_be_bytes());
        assert!(req[4..28].iter().all(|&b| b == 0));
        assert_eq!(&req[28..32], &0xDEAD_BEEFu32.to_be_bytes());
    }

    #[test]
    fn test_resend_request_layout() {
        let req = resend_request(3, 50, 2);
        assert_eq!(req, [0x80, 0xD5, 0, 3, 0, 50, 0, 2]);
    }
}
