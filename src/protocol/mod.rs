//! Wire protocols spoken with the AirPlay sender and the HTTP consumer

pub mod daap;
pub mod headers;
pub mod pairing;
pub mod rtp;
pub mod rtsp;

pub use headers::Headers;
