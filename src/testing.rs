//! Fake codec backends for unit tests

#![allow(clippy::new_without_default)]

use crate::codec::{AlacDecoder, CodecError, FlacEncoder, Fmtp, Mp3Encoder};

/// "Decodes" by copying the packet into the PCM slot, padded with zeros
/// up to one frame. Lets tests feed raw PCM through the pipeline.
pub struct FakeAlac {
    frame_bytes: usize,
}

impl FakeAlac {
    pub fn new() -> Self {
        Self { frame_bytes: 0 }
    }
}

impl AlacDecoder for FakeAlac {
    fn configure(&mut self, fmtp: &Fmtp) -> Result<(), CodecError> {
        self.frame_bytes = fmtp.frame_size() * 4;
        Ok(())
    }

    fn decode(&mut self, packet: &[u8], pcm: &mut [u8]) -> Result<usize, CodecError> {
        let n = packet.len().min(pcm.len()).min(self.frame_bytes);
        pcm[..n].copy_from_slice(&packet[..n]);
        let end = self.frame_bytes.min(pcm.len());
        pcm[n..end].fill(0);
        Ok(end)
    }
}

/// Emits each pass as the raw little-endian bytes of its input, so tests
/// can check block alignment byte for byte.
pub struct FakeMp3 {
    pub pass: usize,
}

impl FakeMp3 {
    pub fn new(pass: usize) -> Self {
        Self { pass }
    }
}

impl Mp3Encoder for FakeMp3 {
    fn reset(&mut self, _bitrate: u32) {}

    fn samples_per_pass(&self) -> usize {
        self.pass
    }

    fn encode(&mut self, interleaved: &[i16], out: &mut Vec<u8>) {
        for s in interleaved {
            out.extend_from_slice(&s.to_le_bytes());
        }
    }

    fn flush(&mut self, out: &mut Vec<u8>) {
        out.extend_from_slice(b"EOF");
    }
}

/// Emits a recognizable stream header at reset and echoes sample bytes on
/// encode; can be told to produce an oversized block.
pub struct FakeFlac {
    pub oversize: bool,
}

impl FakeFlac {
    pub fn new() -> Self {
        Self { oversize: false }
    }
}

impl FlacEncoder for FakeFlac {
    fn reset(&mut self, _level: u32, _block_size: u32, header: &mut Vec<u8>) {
        header.extend_from_slice(b"fLaC-streaminfo");
    }

    fn encode(&mut self, interleaved: &[i32], out: &mut Vec<u8>) {
        if self.oversize {
            out.resize(crate::codec::MAX_FLAC_BYTES + 1, 0xEE);
            return;
        }
        for s in interleaved {
            out.extend_from_slice(&(*s as i16).to_le_bytes());
        }
    }

    fn finish(&mut self, out: &mut Vec<u8>) {
        out.extend_from_slice(b"flac-eof");
    }
}
