//! The streaming engine
//!
//! One [`RaopStreamer`] per AirPlay session. `start` binds the RTP and
//! HTTP sockets out of the configured port window and spawns two tasks,
//! RTP ingest and the HTTP server, around a single shared state guarded
//! by the session mutex. The caller's task drives the lifecycle:
//! [`RaopStreamer::record`], [`RaopStreamer::flush`],
//! [`RaopStreamer::set_metadata`] and [`RaopStreamer::shutdown`].

mod clock;
mod frame;
mod http;
mod ingest;
mod state;
mod tail;


use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Instant;

use rand::Rng;
use tokio::net::{TcpListener, TcpSocket, UdpSocket};
use tokio::task::JoinHandle;

use crate::codec::{AlacDecoder, AudioCodec, CodecBackends, CodecError, Fmtp, make_transcoder};
use crate::crypto::PacketDecryptor;
use crate::protocol::headers::Headers;

pub use clock::{GAP_COUNT, GAP_THRES, ms_to_ntp, ntp_to_ms};
pub use frame::{BUFFER_FRAMES, seq_order};
pub use http::ICY_INTERVAL;
pub use state::{StreamMetadata, StreamStats};
pub use tail::TAIL_SIZE;

use clock::SyncStatus;
use ingest::RtpLink;
use state::StreamState;

/// Streaming session setup and teardown failures.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Every port of the configured window was already bound.
    #[error("no free port in the configured window")]
    PortsExhausted,

    /// The latency string could not be parsed.
    #[error("invalid latency spec: {0}")]
    Latency(String),

    /// Codec configuration failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Socket setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// AES key material negotiated over RTSP.
#[derive(Clone)]
pub struct CipherParams {
    /// AES-128 key
    pub key: [u8; 16],
    /// CBC initialization vector
    pub iv: [u8; 16],
}

/// Latency behavior: RTP hold depth plus optional HTTP-side fill and
/// startup silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySpec {
    /// RTP hold depth in milliseconds
    pub latency_ms: u32,
    /// Emit silence instead of waiting when the ring runs empty
    pub http_fill: bool,
    /// Startup silence fed to a new consumer, in milliseconds
    pub delay_ms: u32,
}

impl LatencySpec {
    fn latency_samples(&self) -> u32 {
        (u64::from(self.latency_ms) * 44_100 / 1000) as u32
    }

    fn delay_frames(&self, frame_size: usize) -> u32 {
        (u64::from(self.delay_ms) * 44_100 / (frame_size as u64 * 1000)) as u32
    }
}

impl Default for LatencySpec {
    fn default() -> Self {
        Self {
            latency_ms: 1000,
            http_fill: false,
            delay_ms: 0,
        }
    }
}

impl FromStr for LatencySpec {
    type Err = StreamError;

    /// Parses the `"ms[:f][:delay_ms]"` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let latency_ms = parts
            .next()
            .unwrap_or_default()
            .trim()
            .parse()
            .map_err(|_| StreamError::Latency(s.to_string()))?;
        let mut spec = Self {
            latency_ms,
            http_fill: false,
            delay_ms: 0,
        };
        for part in parts {
            if part == "f" {
                spec.http_fill = true;
            } else {
                spec.delay_ms = part
                    .trim()
                    .parse()
                    .map_err(|_| StreamError::Latency(s.to_string()))?;
            }
        }
        Ok(spec)
    }
}

/// How the HTTP response frames its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpLength {
    /// `Content-Length: N`, HTTP/1.0
    Length(u64),
    /// Open-ended HTTP/1.0 stream
    Open,
    /// HTTP/1.1 chunked transfer encoding
    Chunked,
}

/// Local port allocation window; ports are drawn from
/// `[base, base + range)` starting at a random offset, falling back
/// sequentially. A zero base asks the OS for ephemeral ports.
#[derive(Debug, Clone, Copy)]
pub struct PortWindow {
    /// First port of the window (0 for ephemeral)
    pub base: u16,
    /// Window size
    pub range: u16,
}

impl Default for PortWindow {
    fn default() -> Self {
        Self { base: 0, range: 1 }
    }
}

/// Events surfaced to the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerEvent {
    /// The first non-silent frame of a play run was decoded.
    Play,
}

/// Event callback type.
pub type EventHook = Box<dyn Fn(StreamerEvent) + Send + Sync>;
/// HTTP response hook: inspect the consumer request, append response
/// headers.
pub type HttpHook = Box<dyn Fn(&Headers, &mut Vec<(String, String)>) + Send + Sync>;

/// Optional callbacks into the session layer.
#[derive(Default)]
pub struct StreamHooks {
    /// Called on [`StreamerEvent`]s
    pub event: Option<EventHook>,
    /// Called while building each HTTP response
    pub http: Option<HttpHook>,
}

/// Everything needed to set up a streaming session.
pub struct StreamConfig {
    /// Local address to bind all sockets on
    pub host: IpAddr,
    /// Sender address; when unset, requests go to the source of the
    /// first inbound packet
    pub peer: Option<IpAddr>,
    /// Output codec for the HTTP stream
    pub codec: AudioCodec,
    /// Playback may not start before a restart-flagged sync packet
    pub sync_required: bool,
    /// Compensate clock drift by inserting/dropping frames
    pub drift_compensation: bool,
    /// Honor `Range` requests from reconnecting consumers
    pub range: bool,
    /// Latency behavior
    pub latency: LatencySpec,
    /// AES key/iv when the stream is encrypted
    pub cipher: Option<CipherParams>,
    /// ALAC format parameters from the SDP
    pub fmtp: Fmtp,
    /// Sender control port
    pub control_rport: u16,
    /// Sender timing port
    pub timing_rport: u16,
    /// Local port allocation window
    pub ports: PortWindow,
    /// HTTP body framing
    pub http_length: HttpLength,
}

/// Local ports allocated for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPorts {
    /// RTP audio data
    pub audio: u16,
    /// RTP control (resend requests land here)
    pub control: u16,
    /// RTP timing
    pub timing: u16,
    /// HTTP consumer port
    pub http: u16,
}

/// State shared between the two tasks and the caller.
pub(crate) struct Shared {
    state: StdMutex<StreamState>,
    pub status: SyncStatus,
    running: AtomicBool,
    pub hooks: StreamHooks,
    epoch: Instant,
    pub http_length: HttpLength,
    pub codec: AudioCodec,
    pub range: bool,
    pub frame_size: usize,
}

impl Shared {
    /// Receiver-local millisecond tick (wraps every ~49 days).
    pub fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn lock_state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One AirPlay streaming session: RTP in, HTTP out.
pub struct RaopStreamer {
    shared: Arc<Shared>,
    ports: StreamPorts,
    rtp_task: JoinHandle<()>,
    http_task: JoinHandle<()>,
}

impl RaopStreamer {
    /// Bind the session sockets and start the ingest and HTTP tasks.
    ///
    /// # Errors
    ///
    /// Fails when the codec seams reject the configuration or the port
    /// window is exhausted.
    pub async fn start(
        config: StreamConfig,
        mut alac: Box<dyn AlacDecoder>,
        backends: CodecBackends,
        hooks: StreamHooks,
    ) -> Result<Self, StreamError> {
        let frame_size = config.fmtp.frame_size();
        alac.configure(&config.fmtp)?;
        let transcoder = make_transcoder(config.codec, backends)?;
        let decryptor = config
            .cipher
            .as_ref()
            .map(|cipher| PacketDecryptor::new(&cipher.key, &cipher.iv));

        let mut picker = PortPicker::new(config.ports);
        let (data_sock, audio) = bind_udp(config.host, &mut picker).await?;
        let (control_sock, control) = bind_udp(config.host, &mut picker).await?;
        let (timing_sock, timing) = bind_udp(config.host, &mut picker).await?;
        let (listener, http) = bind_http(config.host, &mut picker).await?;
        tracing::info!(audio, control, timing, http, "session ports allocated");

        let state = StreamState::new(
            frame_size,
            config.latency.latency_samples(),
            config.latency.delay_frames(frame_size),
            config.latency.http_fill,
            config.drift_compensation,
            config.sync_required,
            decryptor,
            alac,
            transcoder,
        );

        let shared = Arc::new(Shared {
            state: StdMutex::new(state),
            status: SyncStatus::default(),
            running: AtomicBool::new(true),
            hooks,
            epoch: Instant::now(),
            http_length: config.http_length,
            codec: config.codec,
            range: config.range,
            frame_size,
        });
        let link = Arc::new(RtpLink::new(
            Arc::new(control_sock),
            Arc::new(timing_sock),
            config.control_rport,
            config.timing_rport,
            config.peer,
        ));

        let rtp_task = tokio::spawn(ingest::rtp_task(
            shared.clone(),
            link.clone(),
            Arc::new(data_sock),
        ));
        let http_task = tokio::spawn(http::http_task(http::HttpServer::new(
            listener,
            shared.clone(),
            link,
        )));

        Ok(Self {
            shared,
            ports: StreamPorts {
                audio,
                control,
                timing,
                http,
            },
            rtp_task,
            http_task,
        })
    }

    /// Ports allocated for this session.
    #[must_use]
    pub fn ports(&self) -> StreamPorts {
        self.ports
    }

    /// Record the sender's RECORD marker.
    pub fn record(&self, seqno: u16, rtptime: u32) {
        let now = self.shared.now_ms();
        self.shared.lock_state().record(seqno, rtptime, now);
    }

    /// Flush the stream at `seqno`. With `silence` the stream keeps
    /// running on silence frames until newer data arrives. Returns
    /// `false` when the flush duplicated the last RECORD and was
    /// ignored.
    pub fn flush(&self, seqno: u16, rtptime: u32, silence: bool) -> bool {
        let now = self.shared.now_ms();
        self.shared.lock_state().flush(seqno, rtptime, silence, now)
    }

    /// Push new ICY metadata.
    pub fn set_metadata(&self, metadata: StreamMetadata) {
        self.shared.lock_state().set_metadata(metadata);
    }

    /// Counters snapshot.
    #[must_use]
    pub fn stats(&self) -> StreamStats {
        self.shared.lock_state().stats()
    }

    /// Stop both tasks and release all sockets. The tasks observe the
    /// stop flag within one 50 ms tick.
    pub async fn shutdown(self) {
        self.shared.stop();
        let _ = self.rtp_task.await;
        let _ = self.http_task.await;
        tracing::info!("session ended");
    }
}

/// Draws ports from the window at a random offset, falling back
/// sequentially; attempts are shared across all four sockets.
struct PortPicker {
    base: u16,
    range: u16,
    offset: u16,
    count: u16,
}

impl PortPicker {
    fn new(window: PortWindow) -> Self {
        let range = if window.base == 0 {
            1
        } else {
            window.range.max(1)
        };
        Self {
            base: window.base,
            range,
            offset: rand::thread_rng().gen_range(0..range),
            count: 0,
        }
    }

    fn next(&mut self) -> Option<u16> {
        if self.base == 0 {
            return Some(0);
        }
        if self.count >= self.range {
            return None;
        }
        let port = self.base + ((self.offset + self.count) % self.range);
        self.count += 1;
        Some(port)
    }
}

async fn bind_udp(
    host: IpAddr,
    picker: &mut PortPicker,
) -> Result<(UdpSocket, u16), StreamError> {
    loop {
        let Some(port) = picker.next() else {
            return Err(StreamError::PortsExhausted);
        };
        if let Ok(sock) = UdpSocket::bind(SocketAddr::new(host, port)).await {
            let port = sock.local_addr()?.port();
            return Ok((sock, port));
        }
        if port == 0 {
            // the OS itself refused an ephemeral bind
            return Err(StreamError::PortsExhausted);
        }
    }
}

async fn bind_http(
    host: IpAddr,
    picker: &mut PortPicker,
) -> Result<(TcpListener, u16), StreamError> {
    loop {
        let Some(port) = picker.next() else {
            return Err(StreamError::PortsExhausted);
        };
        let socket = match host {
            IpAddr::V4(_) => TcpSocket::new_v4()?,
            IpAddr::V6(_) => TcpSocket::new_v6()?,
        };
        // large transcoded bursts should not block the server loop
        let _ = socket.set_send_buffer_size(128 * 1024);
        if socket.bind(SocketAddr::new(host, port)).is_ok() {
            if let Ok(listener) = socket.listen(1) {
                let port = listener.local_addr()?.port();
                return Ok((listener, port));
            }
        }
        if port == 0 {
            return Err(StreamError::PortsExhausted);
        }
    }
}
