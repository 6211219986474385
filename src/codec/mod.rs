//! Output codec selection and the opaque encoder/decoder seams
//!
//! The real ALAC decoder and MP3/FLAC encoders live outside this crate;
//! they plug in through the small traits below. Everything around them
//! (WAV/PCM framing, block staging, header prefixes, oversize-block
//! handling) is implemented here behind the shared three-operation
//! [`Transcoder`] pipeline.

mod flac;
mod mp3;
mod pcm;
mod wav;

#[cfg(test)]
mod tests;

pub use flac::FlacTranscoder;
pub use mp3::Mp3Transcoder;
pub use pcm::PcmTranscoder;
pub use wav::{WAVE_HEADER, WavTranscoder};

/// FLAC encoder block size in sample frames.
pub const FLAC_BLOCK_SIZE: usize = 1024;
/// Upper bound for one encoded FLAC block; larger blocks are dropped.
pub const MAX_FLAC_BYTES: usize = FLAC_BLOCK_SIZE * 4 + 1024;

/// Codec seam errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The FMTP array does not describe 16-bit samples.
    #[error("unsupported sample size {0}, must be 16")]
    SampleSize(u32),

    /// The FMTP array is malformed or incomplete.
    #[error("malformed fmtp: {0}")]
    Fmtp(String),

    /// The selected output codec has no backend plugged in.
    #[error("no {0} encoder backend configured")]
    MissingBackend(&'static str),

    /// The decoder rejected a packet.
    #[error("decode failed: {0}")]
    Decode(String),
}

/// The twelve format parameters from the session SDP, configuring the
/// ALAC decoder. Index 1 is the frame size, index 3 the sample size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fmtp([u32; 12]);

impl Fmtp {
    /// Build from the raw parameter array.
    ///
    /// # Errors
    ///
    /// Fails when the sample size is not 16 or the frame size is zero.
    pub fn new(values: [u32; 12]) -> Result<Self, CodecError> {
        if values[3] != 16 {
            return Err(CodecError::SampleSize(values[3]));
        }
        if values[1] == 0 {
            return Err(CodecError::Fmtp("frame size is zero".into()));
        }
        Ok(Self(values))
    }

    /// Parse the whitespace-separated SDP form.
    ///
    /// # Errors
    ///
    /// Fails on non-numeric fields or an invalid parameter set.
    pub fn parse(s: &str) -> Result<Self, CodecError> {
        let mut values = [0u32; 12];
        for (slot, field) in values.iter_mut().zip(s.split_ascii_whitespace()) {
            *slot = field
                .parse()
                .map_err(|_| CodecError::Fmtp(format!("bad field {field:?}")))?;
        }
        Self::new(values)
    }

    /// Samples per packet.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        self.0[1] as usize
    }

    /// The raw parameter array.
    #[must_use]
    pub fn values(&self) -> &[u32; 12] {
        &self.0
    }
}

/// Output container/codec selection for the HTTP stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    /// MPEG layer 3
    Mp3 {
        /// Encoder bitrate in kbit/s (0 lets the backend pick its default)
        bitrate: u32,
        /// Offer ICY in-stream metadata to consumers that ask for it
        icy: bool,
    },
    /// FLAC
    Flac {
        /// Encoder compression level
        level: u32,
    },
    /// Raw big-endian L16 PCM
    Pcm,
    /// Little-endian PCM in a WAV container
    Wav,
}

impl AudioCodec {
    /// HTTP `Content-Type` for this codec.
    #[must_use]
    pub fn mime(&self) -> &'static str {
        match self {
            Self::Mp3 { .. } => "audio/mpeg",
            Self::Flac { .. } => "audio/flac",
            Self::Pcm => "audio/L16;rate=44100;channels=2",
            Self::Wav => "audio/wav",
        }
    }

    /// Whether ICY metadata may be offered on this stream.
    #[must_use]
    pub fn icy_capable(&self) -> bool {
        matches!(self, Self::Mp3 { icy: true, .. })
    }
}

/// Opaque ALAC decoder seam.
pub trait AlacDecoder: Send {
    /// Apply the session format parameters.
    ///
    /// # Errors
    ///
    /// Fails when the decoder cannot satisfy the parameter set.
    fn configure(&mut self, fmtp: &Fmtp) -> Result<(), CodecError>;

    /// Decode one packet into `pcm` (little-endian interleaved s16
    /// stereo). `pcm` is sized to one frame; returns the bytes written.
    ///
    /// # Errors
    ///
    /// Fails on a corrupt packet.
    fn decode(&mut self, packet: &[u8], pcm: &mut [u8]) -> Result<usize, CodecError>;
}

/// Opaque MP3 encoder seam.
pub trait Mp3Encoder: Send {
    /// (Re)initialize for a new play run.
    fn reset(&mut self, bitrate: u32);

    /// Stereo sample frames consumed per encode pass.
    fn samples_per_pass(&self) -> usize;

    /// Encode exactly one pass of interleaved samples
    /// (`samples_per_pass() * 2` values), appending output bytes.
    fn encode(&mut self, interleaved: &[i16], out: &mut Vec<u8>);

    /// Flush any pending frames, appending output bytes.
    fn flush(&mut self, out: &mut Vec<u8>);
}

/// Opaque FLAC encoder seam.
pub trait FlacEncoder: Send {
    /// (Re)initialize for a new play run, appending the `fLaC` stream
    /// header and stream-info block to `header`.
    fn reset(&mut self, level: u32, block_size: u32, header: &mut Vec<u8>);

    /// Encode interleaved 32-bit-expanded samples, appending output.
    fn encode(&mut self, interleaved: &[i32], out: &mut Vec<u8>);

    /// Finish the stream, appending any trailing output.
    fn finish(&mut self, out: &mut Vec<u8>);
}

/// The shared output pipeline: one-shot prefixes (WAV header, FLAC
/// stream-info) are emitted by the first `push` after `reset`.
pub trait Transcoder: Send {
    /// Reinitialize at play start.
    fn reset(&mut self);

    /// Transcode one PCM frame (little-endian interleaved s16 stereo),
    /// appending output bytes. May produce nothing while staging.
    fn push(&mut self, pcm: &[u8], out: &mut Vec<u8>);

    /// Drain the encoder at end of stream.
    fn finish(&mut self, out: &mut Vec<u8>);
}

/// Encoder backends supplied by the session layer.
#[derive(Default)]
pub struct CodecBackends {
    /// MP3 encoder, required for [`AudioCodec::Mp3`]
    pub mp3: Option<Box<dyn Mp3Encoder>>,
    /// FLAC encoder, required for [`AudioCodec::Flac`]
    pub flac: Option<Box<dyn FlacEncoder>>,
}

/// Build the transcoder for the selected codec.
///
/// # Errors
///
/// Fails when the codec needs a backend that was not supplied.
pub fn make_transcoder(
    codec: AudioCodec,
    backends: CodecBackends,
) -> Result<Box<dyn Transcoder>, CodecError> {
    Ok(match codec {
        AudioCodec::Wav => Box::new(WavTranscoder::new()),
        AudioCodec::Pcm => Box::new(PcmTranscoder),
        AudioCodec::Mp3 { bitrate, .. } => Box::new(Mp3Transcoder::new(
            backends.mp3.ok_or(CodecError::MissingBackend("mp3"))?,
            bitrate,
        )),
        AudioCodec::Flac { level } => Box::new(FlacTranscoder::new(
            backends.flac.ok_or(CodecError::MissingBackend("flac"))?,
            level,
        )),
    })
}
