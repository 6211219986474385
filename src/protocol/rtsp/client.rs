//! RTSP/1.0 client for the AirPlay control session
//!
//! One TCP connection to the sender, a monotonically increasing `CSeq`,
//! a session id made sticky by SETUP, and a caller-supplied list of
//! extension headers appended to every request. Requests are written in
//! a single send; responses are read line by line with a 10 s timeout on
//! the status line and 1 s between subsequent lines.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::protocol::daap::DaapListing;
use crate::protocol::headers::{Headers, names};
use crate::protocol::pairing::{PairVerify, PairingError, auth_setup_body};

const STATUS_LINE_TIMEOUT: Duration = Duration::from_secs(10);
const HEADER_LINE_TIMEOUT: Duration = Duration::from_secs(1);

/// RTSP client failures.
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer did not answer within the protocol timeout.
    #[error("timed out waiting for response")]
    Timeout,

    /// The status line or a header line was malformed.
    #[error("malformed response: {0}")]
    BadResponse(String),

    /// The peer answered with a non-200 status.
    #[error("request failed with status {0}")]
    Status(u16),

    /// SETUP succeeded but carried no `Session` header.
    #[error("no session in SETUP response")]
    NoSession,

    /// RECORD or FLUSH issued before SETUP established a session.
    #[error("no session in progress")]
    NotSetUp,

    /// Pair-verify body construction failed.
    #[error(transparent)]
    Pairing(#[from] PairingError),
}

/// A parsed RTSP response.
#[derive(Debug, Default)]
pub struct RtspResponse {
    /// Numeric status (0 when the peer sent nothing on a lenient exchange)
    pub status: u16,
    /// Response headers
    pub headers: Headers,
    /// Response body (empty unless `Content-Length` was present)
    pub body: Bytes,
}

/// How strictly a request checks its response.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Exchange {
    /// Response required, status must be 200.
    Strict,
    /// Response is best-effort; a silent or failing peer is tolerated
    /// (used for metadata pushes).
    Lenient,
}

/// RTSP client holding the control connection to the sender.
pub struct RtspClient {
    stream: BufStream<TcpStream>,
    url: String,
    cseq: u32,
    session: Option<String>,
    user_agent: String,
    ext_headers: Vec<(String, String)>,
    local_addr: SocketAddr,
}

impl RtspClient {
    /// Connect to the sender and derive the request URL from its address
    /// and the stream session id.
    ///
    /// # Errors
    ///
    /// Fails if the TCP connection cannot be established.
    pub async fn connect(
        host: IpAddr,
        port: u16,
        sid: &str,
        user_agent: &str,
    ) -> Result<Self, RtspError> {
        let stream = TcpStream::connect((host, port)).await?;
        let local_addr = stream.local_addr()?;
        Ok(Self {
            stream: BufStream::new(stream),
            url: format!("rtsp://{host}/{sid}"),
            cseq: 0,
            session: None,
            user_agent: user_agent.to_string(),
            ext_headers: Vec::new(),
            local_addr,
        })
    }

    /// Local address of the control connection.
    #[must_use]
    pub fn local_addr(&self) -> IpAddr {
        self.local_addr.ip()
    }

    /// Session id returned by SETUP, if any.
    #[must_use]
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Cheap liveness probe for the control connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.stream.get_ref().peer_addr().is_ok()
    }

    /// Add (or replace) an extension header sent with every request.
    pub fn add_header(&mut self, key: &str, value: &str) {
        if let Some(h) = self.ext_headers.iter_mut().find(|(k, _)| k == key) {
            h.1 = value.to_string();
        } else {
            self.ext_headers.push((key.to_string(), value.to_string()));
        }
    }

    /// Remove an extension header.
    pub fn remove_header(&mut self, key: &str) {
        self.ext_headers.retain(|(k, _)| k != key);
    }

    /// `OPTIONS *`
    ///
    /// # Errors
    ///
    /// Fails on transport errors or a non-200 status.
    pub async fn options(&mut self) -> Result<Headers, RtspError> {
        let resp = self
            .request("OPTIONS", Some("*"), &[], None, Exchange::Strict)
            .await?;
        Ok(resp.headers)
    }

    /// `ANNOUNCE` the session SDP.
    ///
    /// # Errors
    ///
    /// Fails on transport errors or a non-200 status.
    pub async fn announce(&mut self, sdp: &str) -> Result<(), RtspError> {
        self.request(
            "ANNOUNCE",
            None,
            &[],
            Some(("application/sdp", sdp.as_bytes())),
            Exchange::Strict,
        )
        .await?;
        Ok(())
    }

    /// `SETUP` the RTP transport, advertising our control and timing
    /// ports. Stores the sticky session id; the returned headers let the
    /// caller read `Transport` and `Audio-Latency`.
    ///
    /// # Errors
    ///
    /// Fails on transport errors, a non-200 status, or a response without
    /// a `Session` header.
    pub async fn setup(
        &mut self,
        control_port: u16,
        timing_port: u16,
    ) -> Result<Headers, RtspError> {
        let transport = format!(
            "RTP/AVP/UDP;unicast;interleaved=0-1;mode=record;control_port={control_port};timing_port={timing_port}"
        );
        let resp = self
            .request(
                "SETUP",
                None,
                &[(names::TRANSPORT, transport)],
                None,
                Exchange::Strict,
            )
            .await?;

        match resp.headers.session() {
            Some(session) => {
                self.session = Some(session.trim().to_string());
                Ok(resp.headers)
            }
            None => Err(RtspError::NoSession),
        }
    }

    /// `RECORD`, telling the sender where the stream starts.
    ///
    /// # Errors
    ///
    /// Fails if SETUP has not run, on transport errors, or a non-200
    /// status.
    pub async fn record(
        &mut self,
        start_seq: u16,
        start_rtptime: u32,
    ) -> Result<Headers, RtspError> {
        if self.session.is_none() {
            return Err(RtspError::NotSetUp);
        }
        let rtp_info = format!("seq={start_seq};rtptime={start_rtptime}");
        let resp = self
            .request(
                "RECORD",
                None,
                &[(names::RANGE, "npt=0-".to_string()), (names::RTP_INFO, rtp_info)],
                None,
                Exchange::Strict,
            )
            .await?;
        Ok(resp.headers)
    }

    /// `SET_PARAMETER` with a `text/parameters` body (volume, progress).
    ///
    /// # Errors
    ///
    /// Fails on transport errors or a non-200 status.
    pub async fn set_parameter(&mut self, param: &str) -> Result<(), RtspError> {
        self.request(
            "SET_PARAMETER",
            None,
            &[],
            Some(("text/parameters", param.as_bytes())),
            Exchange::Strict,
        )
        .await?;
        Ok(())
    }

    /// `SET_PARAMETER` with a DAAP metadata listing, stamped with the
    /// rtptime it applies to. Best-effort: an unresponsive peer is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Fails only on transport errors while sending.
    pub async fn set_daap(&mut self, rtptime: u32, listing: DaapListing) -> Result<(), RtspError> {
        let body = listing.finish();
        self.request(
            "SET_PARAMETER",
            None,
            &[(names::RTP_INFO, format!("rtptime={rtptime}"))],
            Some(("application/x-dmap-tagged", &body)),
            Exchange::Lenient,
        )
        .await?;
        Ok(())
    }

    /// `SET_PARAMETER` with artwork of the given MIME type. Best-effort.
    ///
    /// # Errors
    ///
    /// Fails only on transport errors while sending.
    pub async fn set_artwork(
        &mut self,
        rtptime: u32,
        content_type: &str,
        image: &[u8],
    ) -> Result<(), RtspError> {
        self.request(
            "SET_PARAMETER",
            None,
            &[(names::RTP_INFO, format!("rtptime={rtptime}"))],
            Some((content_type, image)),
            Exchange::Lenient,
        )
        .await?;
        Ok(())
    }

    /// `FLUSH` the stream at the given position.
    ///
    /// # Errors
    ///
    /// Fails on transport errors or a non-200 status.
    pub async fn flush(&mut self, seq: u16, rtptime: u32) -> Result<(), RtspError> {
        let rtp_info = format!("seq={seq};rtptime={rtptime}");
        self.request(
            "FLUSH",
            None,
            &[(names::RTP_INFO, rtp_info)],
            None,
            Exchange::Strict,
        )
        .await?;
        Ok(())
    }

    /// `TEARDOWN` the session.
    ///
    /// # Errors
    ///
    /// Fails on transport errors or a non-200 status.
    pub async fn teardown(&mut self) -> Result<(), RtspError> {
        self.request("TEARDOWN", None, &[], None, Exchange::Strict)
            .await?;
        Ok(())
    }

    /// Run the two-step pair-verify exchange with the stored 32-byte
    /// authentication secret.
    ///
    /// # Errors
    ///
    /// Fails if either POST is rejected or the reply is malformed.
    pub async fn pair_verify(&mut self, secret: &[u8; 32]) -> Result<(), RtspError> {
        let pv = PairVerify::new(secret);

        let step1 = self
            .request(
                "POST",
                Some("/pair-verify"),
                &[],
                Some(("application/octet-stream", &pv.step1_body())),
                Exchange::Strict,
            )
            .await?;

        let step2_body = pv.step2_body(&step1.body)?;
        self.request(
            "POST",
            Some("/pair-verify"),
            &[],
            Some(("application/octet-stream", &step2_body)),
            Exchange::Strict,
        )
        .await?;
        Ok(())
    }

    /// Run the auth-setup exchange (MFi-style key announcement); the
    /// reply is discarded.
    ///
    /// # Errors
    ///
    /// Fails if the POST is rejected.
    pub async fn auth_setup(&mut self) -> Result<(), RtspError> {
        self.request(
            "POST",
            Some("/auth-setup"),
            &[],
            Some(("application/octet-stream", &auth_setup_body())),
            Exchange::Strict,
        )
        .await?;
        Ok(())
    }

    /// Send `TEARDOWN` (best effort) and drop the connection.
    pub async fn disconnect(mut self) {
        let _ = self
            .request("TEARDOWN", None, &[], None, Exchange::Lenient)
            .await;
    }

    async fn request(
        &mut self,
        method: &str,
        url: Option<&str>,
        headers: &[(&str, String)],
        content: Option<(&str, &[u8])>,
        exchange: Exchange,
    ) -> Result<RtspResponse, RtspError> {
        self.cseq += 1;

        let mut req = Vec::with_capacity(512);
        req.extend_from_slice(method.as_bytes());
        req.push(b' ');
        req.extend_from_slice(url.unwrap_or(&self.url).as_bytes());
        req.extend_from_slice(b" RTSP/1.0\r\n");

        for (key, value) in headers {
            push_header(&mut req, key, value);
        }
        if let Some((content_type, body)) = content {
            push_header(&mut req, names::CONTENT_TYPE, content_type);
            push_header(&mut req, names::CONTENT_LENGTH, &body.len().to_string());
        }
        push_header(&mut req, names::CSEQ, &self.cseq.to_string());
        push_header(&mut req, names::USER_AGENT, &self.user_agent);
        for (key, value) in &self.ext_headers {
            push_header(&mut req, key, value);
        }
        if let Some(session) = &self.session {
            push_header(&mut req, names::SESSION, session);
        }
        req.extend_from_slice(b"\r\n");
        if let Some((_, body)) = content {
            req.extend_from_slice(body);
        }

        tracing::debug!(method, cseq = self.cseq, "----> request");
        self.stream.write_all(&req).await?;
        self.stream.flush().await?;

        self.read_response(exchange).await
    }

    async fn read_response(&mut self, exchange: Exchange) -> Result<RtspResponse, RtspError> {
        let status_line = match self.read_line(STATUS_LINE_TIMEOUT).await {
            Ok(Some(line)) if !line.is_empty() => line,
            Ok(_) => {
                return if exchange == Exchange::Lenient {
                    Ok(RtspResponse::default())
                } else {
                    Err(RtspError::BadResponse("empty status line".into()))
                };
            }
            Err(e) => {
                return if exchange == Exchange::Lenient {
                    Ok(RtspResponse::default())
                } else {
                    Err(e)
                };
            }
        };

        let status: u16 = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RtspError::BadResponse(status_line.clone()))?;

        if status != 200 && exchange == Exchange::Strict {
            tracing::error!(status, "<---- request failed");
            return Err(RtspError::Status(status));
        }
        tracing::debug!(status, "<---- response");

        let mut headers = Headers::new();
        let mut last_key: Option<String> = None;
        loop {
            let line = match self.read_line(HEADER_LINE_TIMEOUT).await {
                Ok(Some(line)) if !line.is_empty() => line,
                // blank line, timeout or EOF all end the header block
                _ => break,
            };

            if line.starts_with(' ') {
                if let Some(key) = &last_key {
                    headers.fold(key, line.trim_start());
                }
                continue;
            }

            let Some((key, value)) = line.split_once(':') else {
                return Err(RtspError::BadResponse(line));
            };
            headers.insert(key.trim(), value.trim());
            last_key = Some(key.trim().to_string());
        }

        let mut body = Vec::new();
        if let Some(len) = headers.content_length() {
            body.resize(len, 0);
            timeout(STATUS_LINE_TIMEOUT, self.stream.read_exact(&mut body))
                .await
                .map_err(|_| RtspError::Timeout)??;
        }

        Ok(RtspResponse {
            status,
            headers,
            body: Bytes::from(body),
        })
    }

    /// Read one CRLF-terminated line. `Ok(None)` signals EOF.
    async fn read_line(&mut self, limit: Duration) -> Result<Option<String>, RtspError> {
        let mut raw = Vec::new();
        let n = timeout(limit, self.stream.read_until(b'\n', &mut raw))
            .await
            .map_err(|_| RtspError::Timeout)??;
        if n == 0 {
            return Ok(None);
        }
        while raw.last() == Some(&b'\n') || raw.last() == Some(&b'\r') {
            raw.pop();
        }
        Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
    }
}

fn push_header(req: &mut Vec<u8>, key: &str, value: &str) {
    req.extend_from_slice(key.as_bytes());
    req.extend_from_slice(b": ");
    req.extend_from_slice(value.as_bytes());
    req.extend_from_slice(b"\r\n");
}
