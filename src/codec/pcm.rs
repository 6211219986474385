//! Raw L16 output

use super::Transcoder;

/// Byte-swaps each 16-bit sample to the big-endian network order that
/// `audio/L16` requires.
pub struct PcmTranscoder;

impl Transcoder for PcmTranscoder {
    fn reset(&mut self) {}

    fn push(&mut self, pcm: &[u8], out: &mut Vec<u8>) {
        out.reserve(pcm.len());
        for pair in pcm.chunks_exact(2) {
            out.push(pair[1]);
            out.push(pair[0]);
        }
    }

    fn finish(&mut self, _out: &mut Vec<u8>) {}
}
