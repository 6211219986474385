//! Single-consumer HTTP audio server
//!
//! Accepts one media player at a time, answers its GET with a response
//! framed by the configured `http_length` mode, then paces transcoded
//! frames out of the playback puller. A consumer that reconnects with a
//! `Range` header is replayed from the tail buffer before rejoining the
//! live stream. MP3 consumers that ask for it get SHOUTcast-style ICY
//! metadata spliced into the body every [`ICY_INTERVAL`] bytes.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

use crate::protocol::headers::{Headers, names};

use super::ingest::{RtpLink, apply_effects};
use super::state::{SideEffects, StreamState};
use super::tail::TailBuffer;
use super::{HttpLength, Shared};

/// Body bytes between ICY metadata blocks.
pub const ICY_INTERVAL: usize = 16384;

const SERVER_NAME: &str = "HairTunes";
const ACCEPT_TICK: Duration = Duration::from_millis(50);

/// The connected consumer.
struct HttpConn {
    stream: TcpStream,
    rbuf: Vec<u8>,
    chunked: bool,
}

#[derive(Default)]
struct IcyState {
    interval: usize,
    remain: usize,
}

enum Handled {
    /// GET accepted, start or continue streaming
    Stream,
    /// HEAD or malformed request: close after the response
    Close,
}

pub(crate) struct HttpServer {
    listener: TcpListener,
    shared: Arc<Shared>,
    link: Arc<RtpLink>,
    tail: TailBuffer,
    icy: IcyState,
    frame_period: Duration,
}

impl HttpServer {
    pub fn new(listener: TcpListener, shared: Arc<Shared>, link: Arc<RtpLink>) -> Self {
        let frame_period =
            Duration::from_micros(shared.frame_size as u64 * 1_000_000 / 44_100);
        Self {
            listener,
            shared,
            link,
            tail: TailBuffer::new(),
            icy: IcyState::default(),
            frame_period,
        }
    }
}

/// The server loop: accept, answer requests, pace frames.
pub(crate) async fn http_task(mut srv: HttpServer) {
    let mut conn: Option<HttpConn> = None;
    let mut pcm: Vec<u8> = Vec::new();
    let mut out: Vec<u8> = Vec::new();
    let mut fx = SideEffects::default();
    let mut wait = srv.frame_period * 2;

    while srv.shared.is_running() {
        let Some(client) = conn.as_mut() else {
            if let Ok(Ok((stream, addr))) =
                tokio::time::timeout(ACCEPT_TICK, srv.listener.accept()).await
            {
                let _ = stream.set_nodelay(true);
                let mut st = srv.shared.lock_state();
                st.prime_http_connect();
                tracing::info!(%addr, silence = st.silence_count, "got HTTP connection");
                drop(st);
                conn = Some(HttpConn {
                    stream,
                    rbuf: Vec::new(),
                    chunked: false,
                });
            }
            continue;
        };

        // wake up on a consumer request or on the pacing timeout
        let readable = tokio::select! {
            r = client.stream.readable() => r.is_ok(),
            () = sleep(wait) => false,
        };

        if readable && !drain_requests(&mut srv, client).await {
            tracing::info!("HTTP close");
            srv.shared.lock_state().http_ready = false;
            conn = None;
            continue;
        }

        // pull, transcode and prepare ICY under the lock; send after
        let mut pulled = false;
        let mut paused = false;
        let mut meta: Option<Vec<u8>> = None;
        {
            let now = srv.shared.now_ms();
            let mut st = srv.shared.lock_state();
            paused = st.pause;
            if st.http_ready {
                if st.restart_output {
                    st.restart_output = false;
                    srv.tail.reset();
                }
                out.clear();
                pulled = st.pull_frame(now, &srv.shared.status, &mut fx, &mut pcm);
                if pulled {
                    let state: &mut StreamState = &mut st;
                    state.transcoder.push(&pcm, &mut out);
                }
                if srv.icy.interval > 0 && out.len() > srv.icy.remain {
                    meta = Some(icy_block(&mut st));
                }
            }
        }

        if !fx.is_empty() {
            apply_effects(&srv.shared, &srv.link, &mut fx).await;
        }

        if pulled {
            if !out.is_empty() {
                srv.tail.append(&out);
                if send_interleaved(&mut srv.icy, client, &out, meta).await.is_err() {
                    tracing::info!("HTTP send failed, closing consumer");
                    srv.shared.lock_state().http_ready = false;
                    conn = None;
                    continue;
                }
            }
            // catch up immediately unless paused
            wait = if paused { srv.frame_period } else { Duration::ZERO };
        } else {
            wait = srv.frame_period * 2;
        }
    }

    tracing::info!("http server terminating");
}

/// Read whatever the consumer sent and answer any complete requests.
/// Returns `false` when the connection must be closed.
async fn drain_requests(srv: &mut HttpServer, client: &mut HttpConn) -> bool {
    let mut tmp = [0u8; 2048];
    loop {
        match client.stream.try_read(&mut tmp) {
            Ok(0) => return false,
            Ok(n) => client.rbuf.extend_from_slice(&tmp[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(_) => return false,
        }
    }

    loop {
        match parse_request(&mut client.rbuf) {
            Some(Ok(req)) => match respond(srv, client, &req).await {
                Ok(Handled::Stream) => srv.shared.lock_state().http_ready = true,
                Ok(Handled::Close) | Err(_) => return false,
            },
            Some(Err(())) => return false,
            None => break,
        }
    }
    true
}

/// A parsed consumer request.
struct HttpRequest {
    method: String,
    protocol: String,
    headers: Headers,
}

/// Parse one complete request out of the read buffer. `None` when more
/// bytes are needed, `Some(Err)` on a malformed request line or header.
fn parse_request(rbuf: &mut Vec<u8>) -> Option<Result<HttpRequest, ()>> {
    let head_end = rbuf
        .windows(4)
        .position(|window| window == b"\r\n\r\n")?;

    let head = String::from_utf8_lossy(&rbuf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let Some(method) = parts.next() else {
        return Some(Err(()));
    };
    let _path = parts.next();
    let protocol = parts.next().unwrap_or("HTTP/1.0").to_string();

    let mut headers = Headers::new();
    let mut last_key: Option<String> = None;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(key) = &last_key {
                headers.fold(key, line.trim_start());
            }
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Some(Err(()));
        };
        headers.insert(key.trim(), value.trim());
        last_key = Some(key.trim().to_string());
    }

    // an optional body must be complete before the request is handled
    let body_len = headers.content_length().unwrap_or(0);
    let total = head_end + 4 + body_len;
    if rbuf.len() < total {
        return None;
    }
    let method = method.to_string();
    rbuf.drain(..total);

    Some(Ok(HttpRequest {
        method,
        protocol,
        headers,
    }))
}

/// Answer one request: headers, then an optional Range replay.
async fn respond(
    srv: &mut HttpServer,
    client: &mut HttpConn,
    req: &HttpRequest,
) -> std::io::Result<Handled> {
    let http11 = req.protocol.contains("1.1");
    tracing::info!(method = %req.method, protocol = %req.protocol, "received request");

    let mut resp: Vec<(String, String)> = vec![
        ("Server".into(), SERVER_NAME.into()),
        ("Content-Type".into(), srv.shared.codec.mime().into()),
    ];

    // byte offset into the cumulative output stream, clamped to the tail
    let mut offset = None;
    if srv.shared.range {
        if let Some(value) = req.headers.get(names::RANGE) {
            if let Some(requested) = parse_range(value) {
                let clamped = srv.tail.clamp_offset(requested);
                resp.push((
                    "Content-Range".into(),
                    format!("bytes {clamped}-{}/*", srv.tail.count()),
                ));
                offset = Some(clamped);
            }
        }
    }

    // ICY only on a live MP3 stream and only when the consumer asks
    let icy_wanted = srv.shared.codec.icy_capable()
        && req
            .headers
            .get(names::ICY_METADATA)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .is_some_and(|v| v != 0);
    if icy_wanted {
        resp.push(("icy-metaint".into(), ICY_INTERVAL.to_string()));
        srv.icy.interval = ICY_INTERVAL;
        srv.icy.remain = ICY_INTERVAL;
    } else {
        srv.icy.interval = 0;
    }

    if let Some(hook) = &srv.shared.hooks.http {
        hook(&req.headers, &mut resp);
    }

    let status = if offset.is_some() {
        "206 Partial Content"
    } else {
        "200 OK"
    };

    client.chunked = matches!(srv.shared.http_length, HttpLength::Chunked) && http11;
    let status_line = if client.chunked {
        let connection = req
            .headers
            .get(names::CONNECTION)
            .filter(|v| v.eq_ignore_ascii_case("close") || v.eq_ignore_ascii_case("keep-alive"))
            .unwrap_or("close");
        resp.push(("Connection".into(), connection.into()));
        resp.push(("Transfer-Encoding".into(), "chunked".into()));
        format!("HTTP/1.1 {status}")
    } else {
        if let HttpLength::Length(length) = srv.shared.http_length {
            resp.push(("Content-Length".into(), length.to_string()));
        }
        resp.push(("Connection".into(), "close".into()));
        format!("HTTP/1.0 {status}")
    };

    let head = build_response_head(&status_line, &resp);
    client.stream.write_all(&head).await?;
    tracing::info!(%status_line, "responding");

    if req.method.eq_ignore_ascii_case("HEAD") {
        return Ok(Handled::Close);
    }

    if let Some(offset) = offset {
        replay_range(srv, client, offset).await?;
    }

    Ok(Handled::Stream)
}

/// `Range: bytes=N-` (anything after the first number is ignored).
fn parse_range(value: &str) -> Option<u64> {
    let digits = value.trim().strip_prefix("bytes=")?;
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse().ok()
}

fn build_response_head(status_line: &str, headers: &[(String, String)]) -> Vec<u8> {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(status_line.as_bytes());
    head.extend_from_slice(b"\r\n");
    for (key, value) in headers {
        head.extend_from_slice(key.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Replay the tail from `offset` until the gap to the live stream is
/// closed, keeping the ICY cadence alive with empty metadata blocks.
async fn replay_range(
    srv: &mut HttpServer,
    client: &mut HttpConn,
    mut offset: u64,
) -> std::io::Result<()> {
    srv.shared.lock_state().silence_count = 0;
    tracing::info!(offset, total = srv.tail.count(), "re-sending range");

    while offset < srv.tail.count() {
        let want = if srv.icy.interval > 0 {
            srv.icy.remain
        } else {
            ICY_INTERVAL
        };
        let chunk = srv.tail.chunk_at(offset, want);
        if chunk.is_empty() {
            break;
        }
        let sent = chunk.len();
        send_body(client, chunk).await?;
        offset += sent as u64;

        if srv.icy.interval > 0 {
            srv.icy.remain -= sent;
            if srv.icy.remain == 0 {
                send_body(client, &[0u8]).await?;
                srv.icy.remain = srv.icy.interval;
            }
        }
    }
    Ok(())
}

/// Build the ICY metadata block: a length byte in 16-byte units followed
/// by the padded `StreamTitle`/`StreamURL` text, or a bare zero byte
/// when nothing changed since the last block.
fn icy_block(st: &mut StreamState) -> Vec<u8> {
    if !st.icy_updated {
        return vec![0];
    }
    st.icy_updated = false;

    let meta = &st.metadata;
    let mut text = String::with_capacity(64);
    text.push_str("StreamTitle='");
    text.push_str(&meta.artist);
    if !meta.artist.is_empty() {
        text.push_str(" - ");
    }
    text.push_str(&meta.title);
    text.push_str("';");
    if !meta.artwork.is_empty() {
        text.push_str("StreamURL='");
        text.push_str(&meta.artwork);
        text.push_str("';");
    }
    tracing::info!(%text, "ICY update");

    let units = text.len().div_ceil(16).min(255);
    let mut block = Vec::with_capacity(1 + units * 16);
    block.push(units as u8);
    block.extend_from_slice(&text.as_bytes()[..text.len().min(units * 16)]);
    block.resize(1 + units * 16, 0);
    block
}

/// Send one transcoded block, splitting it at the next metadata boundary
/// when ICY is active.
async fn send_interleaved(
    icy: &mut IcyState,
    client: &mut HttpConn,
    data: &[u8],
    meta: Option<Vec<u8>>,
) -> std::io::Result<()> {
    if icy.interval > 0 && data.len() > icy.remain {
        let split = icy.remain;
        if split > 0 {
            send_body(client, &data[..split]).await?;
        }
        let block = meta.unwrap_or_else(|| vec![0]);
        send_body(client, &block).await?;
        icy.remain = icy.interval;

        send_body(client, &data[split..]).await?;
        icy.remain -= data.len() - split;
    } else {
        send_body(client, data).await?;
        if icy.interval > 0 {
            icy.remain -= data.len();
        }
    }
    Ok(())
}

/// One body write, chunked-framed when the response negotiated it.
async fn send_body(client: &mut HttpConn, data: &[u8]) -> std::io::Result<()> {
    if client.chunked {
        let prefix = format!("{:x}\r\n", data.len());
        client.stream.write_all(prefix.as_bytes()).await?;
        client.stream.write_all(data).await?;
        client.stream.write_all(b"\r\n").await?;
    } else {
        client.stream.write_all(data).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_header() {
        assert_eq!(parse_range("bytes=80000-"), Some(80_000));
        assert_eq!(parse_range(" bytes=0-"), Some(0));
        assert_eq!(parse_range("bytes=123"), Some(123));
        assert_eq!(parse_range("frames=1-"), None);
        assert_eq!(parse_range("bytes=x"), None);
    }

    #[test]
    fn test_parse_request_incremental() {
        let mut rbuf = b"GET / HT".to_vec();
        assert!(parse_request(&mut rbuf).is_none());

        rbuf.extend_from_slice(b"TP/1.1\r\nIcy-MetaData: 1\r\nHost: x\r\n\r\n");
        let req = parse_request(&mut rbuf).unwrap().unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.protocol, "HTTP/1.1");
        assert_eq!(req.headers.get("icy-metadata"), Some("1"));
        assert!(rbuf.is_empty());
    }

    #[test]
    fn test_parse_request_waits_for_body() {
        let mut rbuf = b"POST / HTTP/1.0\r\nContent-Length: 4\r\n\r\nab".to_vec();
        assert!(parse_request(&mut rbuf).is_none());
        rbuf.extend_from_slice(b"cd");
        let req = parse_request(&mut rbuf).unwrap().unwrap();
        assert_eq!(req.method, "POST");
        assert!(rbuf.is_empty());
    }

    #[test]
    fn test_parse_request_rejects_garbage_header() {
        let mut rbuf = b"GET / HTTP/1.0\r\nnot a header\r\n\r\n".to_vec();
        assert!(matches!(parse_request(&mut rbuf), Some(Err(()))));
    }

    #[test]
    fn test_build_response_head() {
        let head = build_response_head(
            "HTTP/1.0 200 OK",
            &[("Server".into(), "HairTunes".into())],
        );
        assert_eq!(head, b"HTTP/1.0 200 OK\r\nServer: HairTunes\r\n\r\n");
    }

    use crate::codec::{AlacDecoder, AudioCodec, CodecBackends, Fmtp, make_transcoder};
    use crate::stream::state::StreamMetadata;
    use crate::testing::FakeAlac;

    fn bare_state() -> StreamState {
        let fmtp = Fmtp::new([0, 4, 0, 16, 0, 0, 0, 0, 0, 0, 0, 44100]).unwrap();
        let mut alac = FakeAlac::new();
        alac.configure(&fmtp).unwrap();
        let transcoder = make_transcoder(AudioCodec::Wav, CodecBackends::default()).unwrap();
        StreamState::new(4, 0, 0, false, false, false, None, Box::new(alac), transcoder)
    }

    #[test]
    fn test_icy_block_padding_and_one_shot() {
        let mut st = bare_state();
        st.set_metadata(StreamMetadata {
            artist: "Artist".into(),
            title: "Title".into(),
            artwork: "http://x/art".into(),
        });

        let block = icy_block(&mut st);
        let text = b"StreamTitle='Artist - Title';StreamURL='http://x/art';";
        let units = text.len().div_ceil(16);
        assert_eq!(block[0] as usize, units);
        assert_eq!(block.len(), 1 + units * 16);
        assert_eq!(&block[1..=text.len()], text);
        assert!(block[1 + text.len()..].iter().all(|&b| b == 0));

        // consumed: the next boundary gets the empty block
        assert_eq!(icy_block(&mut st), vec![0]);
    }

    #[test]
    fn test_icy_block_without_artist_or_artwork() {
        let mut st = bare_state();
        st.set_metadata(StreamMetadata {
            artist: String::new(),
            title: "Solo".into(),
            artwork: String::new(),
        });
        let block = icy_block(&mut st);
        assert_eq!(&block[1..=20], b"StreamTitle='Solo';\0");
    }

    #[tokio::test]
    async fn test_send_interleaved_splits_at_metadata_boundary() {
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server_stream, _) = listener.accept().await.unwrap();
        let mut consumer = connect.await.unwrap();

        let mut conn = HttpConn {
            stream: server_stream,
            rbuf: Vec::new(),
            chunked: false,
        };
        let mut icy = IcyState {
            interval: 16,
            remain: 10,
        };

        let data = [0xAAu8; 14];
        let mut meta = vec![1u8];
        meta.extend_from_slice(&[0xBB; 16]);
        send_interleaved(&mut icy, &mut conn, &data, Some(meta))
            .await
            .unwrap();
        assert_eq!(icy.remain, 12);

        let mut received = vec![0u8; 10 + 17 + 4];
        consumer.read_exact(&mut received).await.unwrap();
        assert!(received[..10].iter().all(|&b| b == 0xAA));
        assert_eq!(received[10], 1);
        assert!(received[11..27].iter().all(|&b| b == 0xBB));
        assert!(received[27..].iter().all(|&b| b == 0xAA));
    }

    #[tokio::test]
    async fn test_send_body_chunked_framing() {
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server_stream, _) = listener.accept().await.unwrap();
        let mut consumer = connect.await.unwrap();

        let mut conn = HttpConn {
            stream: server_stream,
            rbuf: Vec::new(),
            chunked: true,
        };
        send_body(&mut conn, b"abcdef").await.unwrap();

        let mut received = vec![0u8; 6 + 5];
        consumer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, b"6\r\nabcdef\r\n");
    }
}
