use super::*;

use crate::testing::{FakeFlac, FakeMp3};

#[test]
fn test_fmtp_parse() {
    let fmtp = Fmtp::parse("96 352 0 16 40 10 14 2 255 0 0 44100").unwrap();
    assert_eq!(fmtp.frame_size(), 352);
    assert_eq!(fmtp.values()[11], 44100);
}

#[test]
fn test_fmtp_rejects_wrong_sample_size() {
    assert!(matches!(
        Fmtp::parse("96 352 0 24 40 10 14 2 255 0 0 44100"),
        Err(CodecError::SampleSize(24))
    ));
}

#[test]
fn test_mime_types() {
    assert_eq!(AudioCodec::Mp3 { bitrate: 128, icy: false }.mime(), "audio/mpeg");
    assert_eq!(AudioCodec::Flac { level: 5 }.mime(), "audio/flac");
    assert_eq!(AudioCodec::Pcm.mime(), "audio/L16;rate=44100;channels=2");
    assert_eq!(AudioCodec::Wav.mime(), "audio/wav");
}

#[test]
fn test_wav_header_bytes() {
    // normative header: RIFF/WAVE, 44.1 kHz stereo s16, open-ended sizes
    assert_eq!(
        WAVE_HEADER,
        [
            0x52, 0x49, 0x46, 0x46, 0x24, 0xFF, 0xFF, 0xFF, 0x57, 0x41, 0x56, 0x45, 0x66, 0x6D,
            0x74, 0x20, 0x10, 0x00, 0x00, 0x00, 0x01, 0x00, 0x02, 0x00, 0x44, 0xAC, 0x00, 0x00,
            0x10, 0xB1, 0x02, 0x00, 0x04, 0x00, 0x10, 0x00, 0x64, 0x61, 0x74, 0x61, 0x00, 0xFF,
            0xFF, 0xFF
        ]
    );
}

#[test]
fn test_wav_header_emitted_once_per_reset() {
    let mut t = WavTranscoder::new();
    t.reset();

    let mut out = Vec::new();
    t.push(&[1, 2, 3, 4], &mut out);
    assert_eq!(&out[..44], &WAVE_HEADER);
    assert_eq!(&out[44..], &[1, 2, 3, 4]);

    out.clear();
    t.push(&[5, 6], &mut out);
    assert_eq!(out, &[5, 6]);

    t.reset();
    out.clear();
    t.push(&[7, 8], &mut out);
    assert_eq!(&out[..44], &WAVE_HEADER);
}

#[test]
fn test_pcm_byte_swap() {
    let mut t = PcmTranscoder;
    let mut out = Vec::new();
    // two samples, little-endian in, big-endian out
    t.push(&[0x34, 0x12, 0x78, 0x56], &mut out);
    assert_eq!(out, &[0x12, 0x34, 0x56, 0x78]);
}

#[test]
fn test_mp3_staging_feeds_one_block_per_push() {
    // pass of 4 sample frames = 8 interleaved values = 16 bytes
    let mut t = Mp3Transcoder::new(Box::new(FakeMp3::new(4)), 128);
    t.reset();

    let mut out = Vec::new();
    let frame: Vec<u8> = (0u8..12).collect();
    t.push(&frame, &mut out);
    assert!(out.is_empty(), "12 bytes staged, below the 16-byte pass");

    t.push(&frame, &mut out);
    // 24 bytes staged: one 16-byte pass emitted, 8 bytes keep staging
    let mut expected: Vec<u8> = (0u8..12).collect();
    expected.extend(0u8..4);
    assert_eq!(out, expected);

    out.clear();
    t.push(&frame, &mut out);
    // 8 + 12 = 20 staged: the next pass is bytes 4..12 ++ 0..8
    let mut expected: Vec<u8> = (4u8..12).collect();
    expected.extend(0u8..8);
    assert_eq!(out, expected);
}

#[test]
fn test_mp3_reset_clears_staging_and_reinits_encoder() {
    let mut t = Mp3Transcoder::new(Box::new(FakeMp3::new(4)), 320);
    t.reset();
    let mut out = Vec::new();
    t.push(&[1u8; 10], &mut out);
    assert!(out.is_empty());

    t.reset();
    t.push(&[2u8; 16], &mut out);
    // exactly one pass of the new data; no leak from before the reset
    assert_eq!(out.len(), 16);
    assert!(out.iter().all(|&b| b == 2));
}

#[test]
fn test_mp3_finish_flushes_encoder() {
    let mut t = Mp3Transcoder::new(Box::new(FakeMp3::new(4)), 128);
    t.reset();
    let mut out = Vec::new();
    t.finish(&mut out);
    assert_eq!(out, b"EOF");
}

#[test]
fn test_flac_stream_info_prefixes_first_push() {
    let mut t = FlacTranscoder::new(Box::new(FakeFlac::new()), 5);
    t.reset();

    let mut out = Vec::new();
    t.push(&[0x01, 0x00, 0x02, 0x00], &mut out);
    assert!(out.starts_with(b"fLaC-streaminfo"));
    // samples expanded to i32 and echoed back as s16 by the fake
    assert_eq!(&out[15..], &[0x01, 0x00, 0x02, 0x00]);

    out.clear();
    t.push(&[0x03, 0x00], &mut out);
    assert_eq!(out, &[0x03, 0x00]);
}

#[test]
fn test_flac_oversized_block_dropped() {
    let mut t = FlacTranscoder::new(Box::new(FakeFlac { oversize: true }), 5);
    t.reset();

    let mut out = Vec::new();
    t.push(&[0u8; 8], &mut out);
    assert_eq!(out, b"fLaC-streaminfo", "oversized block must not be sent");
}

#[test]
fn test_make_transcoder_requires_backend() {
    assert!(matches!(
        make_transcoder(AudioCodec::Mp3 { bitrate: 128, icy: false }, CodecBackends::default()),
        Err(CodecError::MissingBackend("mp3"))
    ));
    assert!(make_transcoder(AudioCodec::Wav, CodecBackends::default()).is_ok());
}
