//! MP3 output staging

use super::{Mp3Encoder, Transcoder};

/// Accumulates PCM until one encoder pass is available, then feeds a
/// single block and shifts the remainder down. The encoder decides its
/// own pass size (typically 1152 sample frames).
pub struct Mp3Transcoder {
    encoder: Box<dyn Mp3Encoder>,
    bitrate: u32,
    staging: Vec<i16>,
}

impl Mp3Transcoder {
    /// Wrap an encoder backend.
    #[must_use]
    pub fn new(encoder: Box<dyn Mp3Encoder>, bitrate: u32) -> Self {
        Self {
            encoder,
            bitrate,
            staging: Vec::new(),
        }
    }
}

impl Transcoder for Mp3Transcoder {
    fn reset(&mut self) {
        self.staging.clear();
        self.encoder.reset(self.bitrate);
    }

    fn push(&mut self, pcm: &[u8], out: &mut Vec<u8>) {
        self.staging.reserve(pcm.len() / 2);
        for pair in pcm.chunks_exact(2) {
            self.staging.push(i16::from_le_bytes([pair[0], pair[1]]));
        }

        // interleaved stereo values per pass
        let pass = self.encoder.samples_per_pass() * 2;
        if pass > 0 && self.staging.len() >= pass {
            self.encoder.encode(&self.staging[..pass], out);
            self.staging.drain(..pass);
        }
    }

    fn finish(&mut self, out: &mut Vec<u8>) {
        self.encoder.flush(out);
    }
}
