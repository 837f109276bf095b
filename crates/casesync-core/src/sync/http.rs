//! HTTP/1.1 delivery to `POST <base>/facilities/{id}/report`.
//!
//! One connection per report (`Connection: close`). A single deadline bounds
//! connect, write and read for each attempt.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use httparse::Status;
use url::Url;

use super::transport::{Ack, DeliveryError, DeliveryResult, ReportPayload, Transport};
use crate::config::{ConfigError, ConfigResult, SyncConfig};
use crate::models::CaseReport;

const MAX_RESPONSE_HEADER_BYTES: usize = 64 * 1024;
const MAX_RESPONSE_BODY_BYTES: usize = 64 * 1024;
const MAX_LOGGED_BODY_CHARS: usize = 512;

/// Header carrying the report's client-generated token.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Absolute deadline for one delivery attempt.
#[derive(Debug, Clone, Copy)]
struct RequestDeadline {
    expires_at: Instant,
}

impl RequestDeadline {
    fn from_timeout(timeout: Duration) -> Self {
        Self {
            expires_at: Instant::now() + timeout,
        }
    }

    fn remaining(&self) -> DeliveryResult<Duration> {
        self.expires_at
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
            .ok_or(DeliveryError::Timeout)
    }
}

/// Blocking HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base: Url,
    host: String,
    port: u16,
    authority: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> ConfigResult<Self> {
        let invalid = |message: String| ConfigError::InvalidBaseUrl {
            url: base_url.to_string(),
            message,
        };
        let url = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if url.scheme() != "http" {
            return Err(invalid(format!("unsupported scheme {}", url.scheme())));
        }
        let host = url
            .host_str()
            .ok_or_else(|| invalid("missing host".to_string()))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        let authority = if port == 80 {
            host.clone()
        } else {
            format!("{host}:{port}")
        };

        Ok(Self {
            base: ensure_trailing_slash(url),
            host,
            port,
            authority,
            timeout: timeout.max(Duration::from_millis(1)),
        })
    }

    pub fn from_config(config: &SyncConfig) -> ConfigResult<Self> {
        Self::new(&config.base_url, config.request_timeout())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Request path for a facility's report endpoint.
    pub fn report_path(&self, facility_id: i64) -> DeliveryResult<String> {
        let resolved = self
            .base
            .join(&format!("facilities/{}/report", facility_id))
            .map_err(|e| DeliveryError::Encode(e.to_string()))?;
        Ok(resolved.path().to_string())
    }

    fn connect(&self, deadline: &RequestDeadline) -> DeliveryResult<TcpStream> {
        let target = format!("{}:{}", self.host, self.port);
        let addrs: Vec<SocketAddr> = target
            .to_socket_addrs()
            .map_err(|e| DeliveryError::Network(format!("resolve {}: {}", target, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(DeliveryError::Network(format!("no addresses for {}", target)));
        }

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, deadline.remaining()?) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err
            .map(map_io_error)
            .unwrap_or_else(|| DeliveryError::Network(format!("unable to connect to {}", target))))
    }

    fn post(&self, path: &str, key: &str, body: &[u8]) -> DeliveryResult<(u16, Vec<u8>)> {
        let deadline = RequestDeadline::from_timeout(self.timeout);
        let mut stream = self.connect(&deadline)?;

        let head = format!(
            "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nAccept: application/json\r\nContent-Length: {}\r\n{}: {}\r\nConnection: close\r\n\r\n",
            path,
            self.authority,
            body.len(),
            IDEMPOTENCY_HEADER,
            key,
        );

        let remaining = deadline.remaining()?;
        stream.set_write_timeout(Some(remaining)).map_err(map_io_error)?;
        stream.write_all(head.as_bytes()).map_err(map_io_error)?;
        stream.write_all(body).map_err(map_io_error)?;
        stream.flush().map_err(map_io_error)?;

        read_http_response(&mut stream, &deadline)
    }
}

impl Transport for HttpTransport {
    fn deliver(&self, report: &CaseReport) -> DeliveryResult<Ack> {
        let path = self.report_path(report.facility_id)?;
        let body = serde_json::to_vec(&ReportPayload::from(report))
            .map_err(|e| DeliveryError::Encode(e.to_string()))?;

        let (status, response_body) = self.post(&path, &report.idempotency_key, &body)?;
        if (200..300).contains(&status) {
            Ok(Ack { status })
        } else {
            let text: String = String::from_utf8_lossy(&response_body)
                .chars()
                .take(MAX_LOGGED_BODY_CHARS)
                .collect();
            Err(DeliveryError::Rejected { status, body: text })
        }
    }
}

fn read_http_response(
    stream: &mut TcpStream,
    deadline: &RequestDeadline,
) -> DeliveryResult<(u16, Vec<u8>)> {
    let mut buffer = Vec::new();
    let mut temp = [0u8; 1024];
    let header_len = loop {
        stream
            .set_read_timeout(Some(deadline.remaining()?))
            .map_err(map_io_error)?;
        let read = stream.read(&mut temp).map_err(map_io_error)?;
        if read == 0 {
            return Err(DeliveryError::InvalidResponse(
                "connection closed before response headers".to_string(),
            ));
        }
        buffer.extend_from_slice(&temp[..read]);
        if let Some(pos) = find_header_terminator(&buffer) {
            break pos + 4;
        }
        if buffer.len() > MAX_RESPONSE_HEADER_BYTES {
            return Err(DeliveryError::InvalidResponse("headers too large".to_string()));
        }
    };

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(&buffer[..header_len]) {
        Ok(Status::Complete(_)) => {}
        Ok(Status::Partial) => {
            return Err(DeliveryError::InvalidResponse("truncated headers".to_string()))
        }
        Err(e) => return Err(DeliveryError::InvalidResponse(e.to_string())),
    }
    let status = response
        .code
        .ok_or_else(|| DeliveryError::InvalidResponse("missing status code".to_string()))?;

    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    for header in response.headers.iter() {
        if header.name.eq_ignore_ascii_case("Content-Length") {
            content_length = std::str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok());
        } else if header.name.eq_ignore_ascii_case("Transfer-Encoding") {
            chunked = true;
        }
    }

    // The status line decides the outcome; the body is only kept for logs,
    // so a short or stalled body never turns a parsed status into an error.
    let mut body: Vec<u8> = buffer[header_len..].to_vec();
    if chunked {
        return Ok((status, Vec::new()));
    }
    let limit = content_length
        .unwrap_or(MAX_RESPONSE_BODY_BYTES)
        .min(MAX_RESPONSE_BODY_BYTES);
    while body.len() < limit {
        match read_body_chunk(stream, deadline, &mut temp) {
            Ok(0) => break,
            Ok(read) => body.extend_from_slice(&temp[..read]),
            Err(e) => {
                tracing::debug!(status, error = %e, "Response body incomplete");
                break;
            }
        }
    }
    body.truncate(limit);
    Ok((status, body))
}

fn read_body_chunk(
    stream: &mut TcpStream,
    deadline: &RequestDeadline,
    temp: &mut [u8],
) -> DeliveryResult<usize> {
    stream
        .set_read_timeout(Some(deadline.remaining()?))
        .map_err(map_io_error)?;
    stream.read(temp).map_err(map_io_error)
}

fn find_header_terminator(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

fn map_io_error(err: io::Error) -> DeliveryError {
    if matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    ) {
        DeliveryError::Timeout
    } else {
        DeliveryError::Network(err.to_string())
    }
}

fn ensure_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
