//! Instrumented HTTP client.
//!
//! Owns the full call path so every phase can be timed: DNS lookup, TCP
//! dial, TLS handshake, request write, first response byte, body read.
//! Connections are kept alive in a per-origin pool unless keep-alive is
//! disabled; HTTPS connections negotiate HTTP/2 via ALPN when enabled, and
//! certificate verification is disabled.

use std::collections::HashMap;
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use flate2::read::GzDecoder;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

use crate::errors::{ErrorKind, TransportError};
use crate::report::Reporter;
use crate::result::CallResult;

/// Idle connections kept per origin.
const MAX_IDLE_PER_ORIGIN: usize = 500;

/// Configuration for building the HTTP client.
pub struct ClientConfig {
    pub timeout: Duration,
    pub h2: bool,
    pub disable_compression: bool,
    pub disable_keepalive: bool,
    pub proxy: Option<Url>,
    /// Headers merged into every request unless the request sets them.
    pub headers: Vec<(String, String)>,
}

/// One outgoing request, method plus buffered body.
pub struct HttpRequest {
    pub method: &'static str,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set a header unless the request already carries it.
    pub fn set_default_header(&mut self, name: &str, value: &str) {
        if self.header(name).is_none() {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }
}

/// A fully buffered response.
pub struct BufferedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub url: String,
    /// Value of the content-length header; -1 when unknown or when the
    /// body was transparently decompressed.
    pub content_length: i64,
}

impl BufferedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Wall-clock events observed during one call, mirroring the classic
/// client-trace callbacks. Durations are derived after the call finishes.
#[derive(Default)]
struct Trace {
    dns_start: Option<Instant>,
    dns_done: Option<Instant>,
    get_conn: Option<Instant>,
    got_conn: Option<Instant>,
    reused: bool,
    wrote_request: Option<Instant>,
    first_byte: Option<Instant>,
}

impl Trace {
    fn reset_for_retry(&mut self) {
        *self = Trace::default();
    }

    fn to_result(
        &self,
        start: Instant,
        offset: Duration,
        finish: Instant,
        status: u16,
        content_length: i64,
        err: Option<ErrorKind>,
    ) -> CallResult {
        let span = |a: Option<Instant>, b: Option<Instant>| match (a, b) {
            (Some(a), Some(b)) => b.saturating_duration_since(a),
            _ => Duration::ZERO,
        };
        CallResult {
            offset,
            status_code: status,
            err,
            content_length,
            duration: finish.saturating_duration_since(start),
            conn_duration: if self.reused {
                Duration::ZERO
            } else {
                span(self.get_conn, self.got_conn)
            },
            dns_duration: span(self.dns_start, self.dns_done),
            req_duration: span(self.got_conn, self.wrote_request),
            res_duration: span(self.first_byte, Some(finish)),
            delay_duration: span(self.wrote_request, self.first_byte),
        }
    }
}

pub(crate) trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct PoolKey {
    https: bool,
    host: String,
    port: u16,
}

/// Where and how one request travels.
struct Target {
    https: bool,
    host: String,
    port: u16,
    dial_host: String,
    dial_port: u16,
    via_proxy: bool,
    path_and_query: String,
}

impl Target {
    fn parse(url: &Url, proxy: Option<&Url>) -> Result<Target, TransportError> {
        let https = match url.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(TransportError::new(
                    ErrorKind::Protocol,
                    format!("unsupported scheme {other:?}"),
                ))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::new(ErrorKind::Protocol, "url has no host"))?
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| TransportError::new(ErrorKind::Protocol, "url has no port"))?;

        let (dial_host, dial_port, via_proxy) = match proxy {
            Some(p) => {
                let ph = p
                    .host_str()
                    .ok_or_else(|| TransportError::new(ErrorKind::Protocol, "proxy has no host"))?
                    .trim_matches(|c| c == '[' || c == ']')
                    .to_string();
                (ph, p.port_or_known_default().unwrap_or(8080), true)
            }
            None => (host.clone(), port, false),
        };

        let mut path_and_query = url.path().to_string();
        if let Some(q) = url.query() {
            path_and_query.push('?');
            path_and_query.push_str(q);
        }

        Ok(Target {
            https,
            host,
            port,
            dial_host,
            dial_port,
            via_proxy,
            path_and_query,
        })
    }

    fn pool_key(&self) -> PoolKey {
        PoolKey {
            https: self.https,
            host: self.host.clone(),
            port: self.port,
        }
    }

    fn host_header(&self) -> String {
        let default = if self.https { 443 } else { 80 };
        if self.port == default {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

enum Transport {
    H1(Box<dyn Io>),
    H2(h2::client::SendRequest<Bytes>),
}

/// The instrumented client. One instance serves all workers; network I/O
/// runs on the shared tokio runtime, entered via `Handle::block_on` from
/// the calling worker thread.
pub struct HttpClient {
    cfg: ClientConfig,
    handle: Handle,
    origin: Instant,
    tls: TlsConnector,
    h1_pool: Mutex<HashMap<PoolKey, Vec<Box<dyn Io>>>>,
    h2_pool: Mutex<HashMap<PoolKey, h2::client::SendRequest<Bytes>>>,
}

impl HttpClient {
    pub fn new(cfg: ClientConfig, handle: Handle, origin: Instant) -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let provider = rustls::crypto::CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));

        let mut tls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify { provider }))
            .with_no_client_auth();
        tls_config.alpn_protocols = if cfg.h2 {
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        } else {
            vec![b"http/1.1".to_vec()]
        };

        HttpClient {
            cfg,
            handle,
            origin,
            tls: TlsConnector::from(Arc::new(tls_config)),
            h1_pool: Mutex::new(HashMap::new()),
            h2_pool: Mutex::new(HashMap::new()),
        }
    }

    /// Issue one request. Brackets the call with `reporter.start()` /
    /// `reporter.finish(result)`, including on transport error; timing
    /// fields reflect whatever phases were observed.
    pub fn execute(
        &self,
        mut req: HttpRequest,
        reporter: &dyn Reporter,
    ) -> Result<BufferedResponse, TransportError> {
        for (name, value) in &self.cfg.headers {
            req.set_default_header(name, value);
        }

        let start = Instant::now();
        let offset = self.origin.elapsed();
        let mut trace = Trace::default();

        reporter.start();
        let outcome = self.handle.block_on(async {
            match tokio::time::timeout(self.cfg.timeout, self.call(&req, &mut trace)).await {
                Ok(res) => res,
                Err(_) => Err(TransportError::new(
                    ErrorKind::Timeout,
                    format!("no response within {:?}", self.cfg.timeout),
                )),
            }
        });
        let finish = Instant::now();

        let result = match &outcome {
            Ok(resp) => trace.to_result(start, offset, finish, resp.status, resp.content_length, None),
            Err(err) => trace.to_result(start, offset, finish, 0, 0, Some(err.kind)),
        };
        reporter.finish(result);
        outcome
    }

    async fn call(
        &self,
        req: &HttpRequest,
        trace: &mut Trace,
    ) -> Result<BufferedResponse, TransportError> {
        let target = Target::parse(&req.url, self.cfg.proxy.as_ref())?;

        if let Some(transport) = self.checkout(&target) {
            let now = Instant::now();
            trace.get_conn = Some(now);
            trace.got_conn = Some(now);
            trace.reused = true;
            match self.dispatch(req, &target, transport, trace).await {
                Ok(resp) => return Ok(resp),
                Err(err) if trace.first_byte.is_none() => {
                    // The pooled connection died under us before any response
                    // bytes arrived; run the request again on a fresh dial.
                    debug!(error = %err, "retrying on a fresh connection");
                    self.discard(&target);
                    trace.reset_for_retry();
                }
                Err(err) => return Err(err),
            }
        }

        let transport = self.dial(&target, trace).await?;
        self.dispatch(req, &target, transport, trace).await
    }

    async fn dispatch(
        &self,
        req: &HttpRequest,
        target: &Target,
        transport: Transport,
        trace: &mut Trace,
    ) -> Result<BufferedResponse, TransportError> {
        match transport {
            Transport::H1(io) => self.call_h1(req, target, io, trace).await,
            Transport::H2(sr) => self.call_h2(req, target, sr, trace).await,
        }
    }

    fn checkout(&self, target: &Target) -> Option<Transport> {
        if self.cfg.disable_keepalive {
            return None;
        }
        let key = target.pool_key();
        if let Some(sr) = self.h2_pool.lock().unwrap().get(&key).cloned() {
            return Some(Transport::H2(sr));
        }
        self.h1_pool
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|v| v.pop())
            .map(Transport::H1)
    }

    fn checkin(&self, target: &Target, io: Box<dyn Io>) {
        if self.cfg.disable_keepalive {
            return;
        }
        let mut pool = self.h1_pool.lock().unwrap();
        let conns = pool.entry(target.pool_key()).or_default();
        if conns.len() < MAX_IDLE_PER_ORIGIN {
            conns.push(io);
        }
    }

    fn discard(&self, target: &Target) {
        self.h2_pool.lock().unwrap().remove(&target.pool_key());
    }

    async fn resolve(
        &self,
        host: &str,
        port: u16,
        trace: &mut Trace,
    ) -> Result<SocketAddr, TransportError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        trace.dns_start = Some(Instant::now());
        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| TransportError::new(ErrorKind::Dns, format!("lookup {host}: {e}")))?;
        trace.dns_done = Some(Instant::now());
        addrs
            .next()
            .ok_or_else(|| TransportError::new(ErrorKind::Dns, format!("lookup {host}: no addresses")))
    }

    async fn dial(&self, target: &Target, trace: &mut Trace) -> Result<Transport, TransportError> {
        trace.get_conn = Some(Instant::now());
        let addr = self.resolve(&target.dial_host, target.dial_port, trace).await?;
        let mut tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::new(ErrorKind::Connect, format!("connect {addr}: {e}")))?;
        let _ = tcp.set_nodelay(true);

        if target.via_proxy && target.https {
            self.connect_tunnel(&mut tcp, target).await?;
        }

        if target.https {
            let sni = ServerName::try_from(target.host.clone()).map_err(|e| {
                TransportError::new(ErrorKind::Tls, format!("server name {}: {e}", target.host))
            })?;
            let tls = self
                .tls
                .connect(sni, tcp)
                .await
                .map_err(|e| TransportError::new(ErrorKind::Tls, format!("handshake: {e}")))?;
            if tls.get_ref().1.alpn_protocol() == Some(&b"h2"[..]) {
                let (sr, conn) = h2::client::handshake(tls)
                    .await
                    .map_err(|e| TransportError::new(ErrorKind::Protocol, format!("h2 handshake: {e}")))?;
                self.handle.spawn(async move {
                    let _ = conn.await;
                });
                trace.got_conn = Some(Instant::now());
                if !self.cfg.disable_keepalive {
                    self.h2_pool
                        .lock()
                        .unwrap()
                        .insert(target.pool_key(), sr.clone());
                }
                return Ok(Transport::H2(sr));
            }
            trace.got_conn = Some(Instant::now());
            Ok(Transport::H1(Box::new(tls)))
        } else {
            trace.got_conn = Some(Instant::now());
            Ok(Transport::H1(Box::new(tcp)))
        }
    }

    /// Establish a CONNECT tunnel through the configured proxy.
    async fn connect_tunnel(
        &self,
        tcp: &mut TcpStream,
        target: &Target,
    ) -> Result<(), TransportError> {
        let connect = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nhost: {host}:{port}\r\n\r\n",
            host = target.host,
            port = target.port,
        );
        tcp.write_all(connect.as_bytes())
            .await
            .map_err(|e| TransportError::io("proxy connect", &e))?;

        let mut buf = Vec::with_capacity(256);
        let mut chunk = [0u8; 256];
        loop {
            let n = tcp
                .read(&mut chunk)
                .await
                .map_err(|e| TransportError::io("proxy connect", &e))?;
            if n == 0 {
                return Err(TransportError::new(
                    ErrorKind::Connect,
                    "proxy closed during CONNECT",
                ));
            }
            buf.extend_from_slice(&chunk[..n]);
            if find_head_end(&buf).is_some() {
                break;
            }
        }
        let head = String::from_utf8_lossy(&buf);
        let status = head
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(0);
        if !(200..300).contains(&status) {
            return Err(TransportError::new(
                ErrorKind::Connect,
                format!("proxy CONNECT returned {status}"),
            ));
        }
        Ok(())
    }

    async fn call_h1(
        &self,
        req: &HttpRequest,
        target: &Target,
        mut io: Box<dyn Io>,
        trace: &mut Trace,
    ) -> Result<BufferedResponse, TransportError> {
        let head = self.encode_head(req, target);
        io.write_all(&head)
            .await
            .map_err(|e| TransportError::io("write request", &e))?;
        if let Some(body) = &req.body {
            io.write_all(body)
                .await
                .map_err(|e| TransportError::io("write body", &e))?;
        }
        io.flush()
            .await
            .map_err(|e| TransportError::io("flush request", &e))?;
        trace.wrote_request = Some(Instant::now());

        let mut reader = H1Reader::new(&mut io);
        let head = reader.read_head(trace).await?;
        let parsed = parse_head(&head)?;
        let (body, close_delimited) = reader.read_body(&parsed).await?;

        let gzipped = parsed
            .header("content-encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
        let (body, content_length) = if gzipped && !self.cfg.disable_compression {
            (gunzip(&body)?, -1)
        } else {
            (body, parsed.content_length.unwrap_or(-1))
        };

        if parsed.keep_alive && !close_delimited && !self.cfg.disable_keepalive {
            self.checkin(target, io);
        }

        Ok(BufferedResponse {
            status: parsed.status,
            headers: parsed.headers,
            body,
            url: req.url.to_string(),
            content_length,
        })
    }

    async fn call_h2(
        &self,
        req: &HttpRequest,
        _target: &Target,
        sr: h2::client::SendRequest<Bytes>,
        trace: &mut Trace,
    ) -> Result<BufferedResponse, TransportError> {
        let h2err =
            |e: h2::Error| TransportError::new(ErrorKind::Protocol, format!("h2: {e}"));

        let mut builder = http::Request::builder()
            .method(req.method)
            .uri(req.url.as_str());
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request = builder
            .body(())
            .map_err(|e| TransportError::new(ErrorKind::Protocol, format!("build request: {e}")))?;

        let mut sr = sr.ready().await.map_err(h2err)?;
        let (response, mut stream) = sr.send_request(request, req.body.is_none()).map_err(h2err)?;
        if let Some(body) = &req.body {
            stream
                .send_data(Bytes::copy_from_slice(body), true)
                .map_err(h2err)?;
        }
        trace.wrote_request = Some(Instant::now());

        let response = response.await.map_err(h2err)?;
        trace.first_byte = Some(Instant::now());

        let (parts, mut recv) = response.into_parts();
        let mut body = Vec::new();
        while let Some(chunk) = recv.data().await {
            let chunk = chunk.map_err(h2err)?;
            body.extend_from_slice(&chunk);
            let _ = recv.flow_control().release_capacity(chunk.len());
        }

        let headers: Vec<(String, String)> = parts
            .headers
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let content_length = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.parse::<i64>().ok());

        let gzipped = headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("content-encoding") && v.eq_ignore_ascii_case("gzip"));
        let (body, content_length) = if gzipped && !self.cfg.disable_compression {
            (gunzip(&body)?, -1)
        } else {
            (body, content_length.unwrap_or(-1))
        };

        Ok(BufferedResponse {
            status: parts.status.as_u16(),
            headers,
            body,
            url: req.url.to_string(),
            content_length,
        })
    }

    fn encode_head(&self, req: &HttpRequest, target: &Target) -> Vec<u8> {
        let request_target = if target.via_proxy && !target.https {
            req.url.as_str().to_string()
        } else {
            target.path_and_query.clone()
        };

        let mut head = format!("{} {} HTTP/1.1\r\n", req.method, request_target);
        head.push_str(&format!("host: {}\r\n", target.host_header()));
        if self.cfg.disable_keepalive {
            head.push_str("connection: close\r\n");
        }
        if !self.cfg.disable_compression && req.header("accept-encoding").is_none() {
            head.push_str("accept-encoding: gzip\r\n");
        }
        for (name, value) in &req.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        if let Some(body) = &req.body {
            if req.header("content-length").is_none() {
                head.push_str(&format!("content-length: {}\r\n", body.len()));
            }
        }
        head.push_str("\r\n");
        head.into_bytes()
    }
}

/// Parsed response head.
struct ResponseHead {
    status: u16,
    headers: Vec<(String, String)>,
    content_length: Option<i64>,
    chunked: bool,
    keep_alive: bool,
}

impl ResponseHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_head(head: &[u8]) -> Result<ResponseHead, TransportError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| TransportError::new(ErrorKind::Protocol, "non-utf8 response head"))?;
    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| TransportError::new(ErrorKind::Protocol, "empty response head"))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| TransportError::new(ErrorKind::Protocol, "missing http version"))?;
    if !version.starts_with("HTTP/1.") {
        return Err(TransportError::new(
            ErrorKind::Protocol,
            format!("unexpected version {version:?}"),
        ));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransportError::new(ErrorKind::Protocol, "bad status line"))?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            TransportError::new(ErrorKind::Protocol, format!("malformed header {line:?}"))
        })?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let find = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };

    let content_length = find("content-length").and_then(|v| v.parse::<i64>().ok());
    let chunked = find("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    let http11 = version.starts_with("HTTP/1.1");
    let keep_alive = match find("connection").map(|v| v.to_ascii_lowercase()) {
        Some(v) if v.contains("close") => false,
        Some(v) if v.contains("keep-alive") => true,
        _ => http11,
    };

    Ok(ResponseHead {
        status,
        headers,
        content_length,
        chunked,
        keep_alive,
    })
}

/// Incremental reader over an HTTP/1.1 response: head, then a body framed
/// by content-length, chunked encoding, or connection close.
struct H1Reader<'a> {
    io: &'a mut Box<dyn Io>,
    buf: Vec<u8>,
}

impl<'a> H1Reader<'a> {
    fn new(io: &'a mut Box<dyn Io>) -> Self {
        H1Reader {
            io,
            buf: Vec::with_capacity(8 * 1024),
        }
    }

    async fn fill(&mut self) -> Result<usize, TransportError> {
        let mut chunk = [0u8; 16 * 1024];
        let n = self
            .io
            .read(&mut chunk)
            .await
            .map_err(|e| TransportError::io("read response", &e))?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    async fn read_head(&mut self, trace: &mut Trace) -> Result<Vec<u8>, TransportError> {
        loop {
            if let Some(end) = find_head_end(&self.buf) {
                let rest = self.buf.split_off(end);
                let head = std::mem::replace(&mut self.buf, rest);
                return Ok(head);
            }
            let before = self.buf.is_empty();
            let n = self.fill().await?;
            if n == 0 {
                return Err(TransportError::new(
                    ErrorKind::Protocol,
                    "connection closed before response head",
                ));
            }
            if before && trace.first_byte.is_none() {
                trace.first_byte = Some(Instant::now());
            }
        }
    }

    /// Returns the body and whether the body was delimited by connection
    /// close (in which case the connection cannot be reused).
    async fn read_body(
        &mut self,
        head: &ResponseHead,
    ) -> Result<(Vec<u8>, bool), TransportError> {
        if head.status == 204 || head.status == 304 || (100..200).contains(&head.status) {
            return Ok((Vec::new(), false));
        }
        if head.chunked {
            let body = self.read_chunked().await?;
            return Ok((body, false));
        }
        if let Some(len) = head.content_length {
            let len = len.max(0) as usize;
            while self.buf.len() < len {
                if self.fill().await? == 0 {
                    return Err(TransportError::new(
                        ErrorKind::Protocol,
                        "connection closed mid-body",
                    ));
                }
            }
            let rest = self.buf.split_off(len);
            let body = std::mem::replace(&mut self.buf, rest);
            return Ok((body, false));
        }
        // No framing: the body runs to EOF and the connection is spent.
        while self.fill().await? > 0 {}
        Ok((std::mem::take(&mut self.buf), true))
    }

    async fn read_line(&mut self) -> Result<String, TransportError> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let rest = self.buf.split_off(pos + 2);
                let line = std::mem::replace(&mut self.buf, rest);
                return Ok(String::from_utf8_lossy(&line[..line.len() - 2]).into_owned());
            }
            if self.fill().await? == 0 {
                return Err(TransportError::new(
                    ErrorKind::Protocol,
                    "connection closed mid-chunk",
                ));
            }
        }
    }

    async fn read_exact_body(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        while self.buf.len() < len {
            if self.fill().await? == 0 {
                return Err(TransportError::new(
                    ErrorKind::Protocol,
                    "connection closed mid-chunk",
                ));
            }
        }
        let rest = self.buf.split_off(len);
        Ok(std::mem::replace(&mut self.buf, rest))
    }

    async fn read_chunked(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut body = Vec::new();
        loop {
            let size_line = self.read_line().await?;
            let size_hex = size_line.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_hex, 16).map_err(|_| {
                TransportError::new(
                    ErrorKind::Protocol,
                    format!("bad chunk size {size_line:?}"),
                )
            })?;
            if size == 0 {
                // Trailers until the terminating empty line.
                loop {
                    if self.read_line().await?.is_empty() {
                        return Ok(body);
                    }
                }
            }
            let chunk = self.read_exact_body(size + 2).await?;
            body.extend_from_slice(&chunk[..size]);
        }
    }
}

fn gunzip(body: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut out = Vec::with_capacity(body.len() * 2);
    GzDecoder::new(body)
        .read_to_end(&mut out)
        .map_err(|e| TransportError::new(ErrorKind::Protocol, format!("gzip decode: {e}")))?;
    Ok(out)
}

#[derive(Debug)]
struct NoVerify {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_head_basic() {
        let head = b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\nx-a: b\r\n\r\n";
        let parsed = parse_head(head).unwrap();
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.content_length, Some(5));
        assert!(!parsed.chunked);
        assert!(parsed.keep_alive);
        assert_eq!(parsed.header("x-a"), Some("b"));
    }

    #[test]
    fn test_parse_head_connection_close() {
        let head = b"HTTP/1.1 500 Internal Server Error\r\nConnection: close\r\n\r\n";
        let parsed = parse_head(head).unwrap();
        assert_eq!(parsed.status, 500);
        assert!(!parsed.keep_alive);
    }

    #[test]
    fn test_parse_head_chunked() {
        let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let parsed = parse_head(head).unwrap();
        assert!(parsed.chunked);
        assert_eq!(parsed.content_length, None);
    }

    #[test]
    fn test_parse_head_rejects_garbage() {
        assert!(parse_head(b"SIP/2.0 200 OK\r\n\r\n").is_err());
        assert!(parse_head(b"HTTP/1.1 abc\r\n\r\n").is_err());
    }

    #[test]
    fn test_target_parse_defaults() {
        let url = Url::parse("http://example.com/a/b?x=1").unwrap();
        let t = Target::parse(&url, None).unwrap();
        assert!(!t.https);
        assert_eq!(t.port, 80);
        assert_eq!(t.path_and_query, "/a/b?x=1");
        assert_eq!(t.host_header(), "example.com");

        let url = Url::parse("https://example.com:8443/").unwrap();
        let t = Target::parse(&url, None).unwrap();
        assert!(t.https);
        assert_eq!(t.host_header(), "example.com:8443");
    }

    #[test]
    fn test_target_parse_proxy_dials_proxy() {
        let url = Url::parse("http://example.com/").unwrap();
        let proxy = Url::parse("http://127.0.0.1:3128").unwrap();
        let t = Target::parse(&url, Some(&proxy)).unwrap();
        assert!(t.via_proxy);
        assert_eq!(t.dial_host, "127.0.0.1");
        assert_eq!(t.dial_port, 3128);
        assert_eq!(t.host, "example.com");
    }

    #[test]
    fn test_trace_durations() {
        let t0 = Instant::now();
        let at = |ms: u64| Some(t0 + Duration::from_millis(ms));
        let trace = Trace {
            dns_start: at(0),
            dns_done: at(10),
            get_conn: at(0),
            got_conn: at(30),
            reused: false,
            wrote_request: at(35),
            first_byte: at(95),
        };
        let result = trace.to_result(
            t0,
            Duration::ZERO,
            t0 + Duration::from_millis(100),
            200,
            42,
            None,
        );
        assert_eq!(result.dns_duration, Duration::from_millis(10));
        assert_eq!(result.conn_duration, Duration::from_millis(30));
        assert_eq!(result.req_duration, Duration::from_millis(5));
        assert_eq!(result.delay_duration, Duration::from_millis(60));
        assert_eq!(result.res_duration, Duration::from_millis(5));
        assert_eq!(result.duration, Duration::from_millis(100));
    }

    #[test]
    fn test_trace_reused_connection_reports_zero_conn() {
        let t0 = Instant::now();
        let trace = Trace {
            get_conn: Some(t0),
            got_conn: Some(t0 + Duration::from_millis(20)),
            reused: true,
            ..Trace::default()
        };
        let result = trace.to_result(t0, Duration::ZERO, t0 + Duration::from_millis(50), 200, 0, None);
        assert_eq!(result.conn_duration, Duration::ZERO);
        assert_eq!(result.dns_duration, Duration::ZERO);
    }
}
