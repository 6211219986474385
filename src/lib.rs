//! # airtap
//!
//! An AirPlay v1/v2 audio receiver core. It terminates the RTSP control
//! session from an AirPlay sender, ingests the sender's RTP audio stream
//! (data, control and timing channels), reconstructs a continuous PCM
//! timeline slaved to the sender's clock, and re-serves that timeline as a
//! local HTTP audio stream in WAV, raw PCM, MP3 or FLAC framing.
//!
//! The crate owns the hard parts of the pipeline: the circular reassembly
//! buffer with resend requests, the NTP-style + RTP two-clock
//! synchronization loop, drift compensation by frame insert/drop, and the
//! single-consumer HTTP server with Range re-send and ICY metadata.
//! Discovery, pairing UI and the actual codec libraries live outside; the
//! codec seams are expressed as small traits in [`codec`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use airtap::stream::{RaopStreamer, StreamConfig, StreamHooks};
//!
//! # async fn example(config: StreamConfig, backends: airtap::codec::CodecBackends,
//! #                  alac: Box<dyn airtap::codec::AlacDecoder>) -> Result<(), airtap::Error> {
//! let streamer = RaopStreamer::start(config, alac, backends, StreamHooks::default()).await?;
//! let ports = streamer.ports();
//! println!("serving audio on http://127.0.0.1:{}/", ports.http);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Output codec selection and the opaque encoder/decoder seams
pub mod codec;
/// Cipher helpers for the RTP payload and pair-verify
pub mod crypto;
/// Error types
pub mod error;
/// Wire protocols: RTP, RTSP, DAAP, pair-verify
pub mod protocol;
/// The streaming engine: session lifecycle, ingest, playback, HTTP output
pub mod stream;

#[cfg(test)]
mod testing;

pub use error::Error;
pub use stream::{RaopStreamer, StreamConfig, StreamPorts, StreamerEvent};
