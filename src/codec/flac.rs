//! FLAC output staging

use super::{FlacEncoder, Transcoder};
use super::{FLAC_BLOCK_SIZE, MAX_FLAC_BYTES};

/// Expands s16 PCM to the 32-bit interleaved samples the encoder wants
/// and prefixes the stream-info block emitted at reset. Encoded blocks
/// above [`MAX_FLAC_BYTES`] are dropped.
pub struct FlacTranscoder {
    encoder: Box<dyn FlacEncoder>,
    level: u32,
    prefix: Vec<u8>,
    header_pending: bool,
    samples: Vec<i32>,
    scratch: Vec<u8>,
}

impl FlacTranscoder {
    /// Wrap an encoder backend.
    #[must_use]
    pub fn new(encoder: Box<dyn FlacEncoder>, level: u32) -> Self {
        Self {
            encoder,
            level,
            prefix: Vec::new(),
            header_pending: false,
            samples: Vec::new(),
            scratch: Vec::new(),
        }
    }
}

impl Transcoder for FlacTranscoder {
    fn reset(&mut self) {
        self.prefix.clear();
        self.encoder
            .reset(self.level, FLAC_BLOCK_SIZE as u32, &mut self.prefix);
        self.header_pending = true;
    }

    fn push(&mut self, pcm: &[u8], out: &mut Vec<u8>) {
        if self.header_pending {
            out.extend_from_slice(&self.prefix);
            self.header_pending = false;
        }

        self.samples.clear();
        self.samples.reserve(pcm.len() / 2);
        for pair in pcm.chunks_exact(2) {
            self.samples
                .push(i32::from(i16::from_le_bytes([pair[0], pair[1]])));
        }

        self.scratch.clear();
        self.encoder.encode(&self.samples, &mut self.scratch);
        if self.scratch.len() > MAX_FLAC_BYTES {
            tracing::warn!(bytes = self.scratch.len(), "flac coded buffer too big");
        } else {
            out.extend_from_slice(&self.scratch);
        }
    }

    fn finish(&mut self, out: &mut Vec<u8>) {
        self.encoder.finish(out);
    }
}
