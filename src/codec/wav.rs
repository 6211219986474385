//! WAV container output

use super::Transcoder;

/// Fixed 44-byte RIFF/WAVE header for 44.1 kHz stereo s16, with
/// "infinite" chunk length markers since the stream has no known end.
pub const WAVE_HEADER: [u8; 44] = [
    b'R', b'I', b'F', b'F', //
    0x24, 0xFF, 0xFF, 0xFF, //
    b'W', b'A', b'V', b'E', //
    b'f', b'm', b't', b' ', //
    0x10, 0x00, 0x00, 0x00, // fmt chunk size
    0x01, 0x00, // PCM
    0x02, 0x00, // stereo
    0x44, 0xAC, 0x00, 0x00, // 44100
    0x10, 0xB1, 0x02, 0x00, // byte rate
    0x04, 0x00, // block align
    0x10, 0x00, // bits per sample
    b'd', b'a', b't', b'a', //
    0x00, 0xFF, 0xFF, 0xFF,
];

/// Little-endian PCM behind a one-shot WAV header.
pub struct WavTranscoder {
    header_pending: bool,
}

impl WavTranscoder {
    /// Create with the header armed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            header_pending: true,
        }
    }
}

impl Default for WavTranscoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcoder for WavTranscoder {
    fn reset(&mut self) {
        self.header_pending = true;
    }

    fn push(&mut self, pcm: &[u8], out: &mut Vec<u8>) {
        if self.header_pending {
            out.extend_from_slice(&WAVE_HEADER);
            self.header_pending = false;
        }
        out.extend_from_slice(pcm);
    }

    fn finish(&mut self, _out: &mut Vec<u8>) {}
}
