//! Minimal HTTP/1.0 client
//!
//! The cluster REST endpoints need exactly one request shape each: a GET
//! for the bucket config and a form POST for the query service. Both ride
//! the same hand-rolled HTTP/1.0 exchange over a blocking socket so the
//! driver keeps a single deadline mechanism (per-operation socket
//! timeouts).

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

const USER_AGENT: &str = concat!("mcbucket/", env!("CARGO_PKG_VERSION"));

/// Parsed HTTP response: status code plus raw body bytes.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Issues `GET <path>` against `host:port`.
///
/// `basic_auth` is the pre-encoded `base64(user:pass)` token.
pub fn get(
    host: &str,
    port: u16,
    path: &str,
    basic_auth: Option<&str>,
    timeout: Duration,
) -> io::Result<HttpResponse> {
    let mut request = format!("GET {path} HTTP/1.0\r\nHost: {host}:{port}\r\nUser-Agent: {USER_AGENT}\r\n");
    if let Some(token) = basic_auth {
        request.push_str(&format!("Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");

    exchange(host, port, request.as_bytes(), timeout)
}

/// Issues `POST <path>` with a form-urlencoded body.
pub fn post_form(
    host: &str,
    port: u16,
    path: &str,
    basic_auth: Option<&str>,
    body: &str,
    timeout: Duration,
) -> io::Result<HttpResponse> {
    let mut request = format!(
        "POST {path} HTTP/1.0\r\nHost: {host}:{port}\r\nUser-Agent: {USER_AGENT}\r\n\
         Content-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n",
        body.len()
    );
    if let Some(token) = basic_auth {
        request.push_str(&format!("Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");

    let mut bytes = request.into_bytes();
    bytes.extend_from_slice(body.as_bytes());

    exchange(host, port, &bytes, timeout)
}

fn exchange(host: &str, port: u16, request: &[u8], timeout: Duration) -> io::Result<HttpResponse> {
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses found"))?;

    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    stream.write_all(request)?;
    stream.flush()?;

    read_response(stream)
}

fn read_response(stream: TcpStream) -> io::Result<HttpResponse> {
    let mut reader = BufReader::new(stream);

    let mut status_line = String::new();
    reader.read_line(&mut status_line)?;
    let status = parse_status_line(&status_line)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed status line"))?;

    // Scan headers up to the blank line, recording Content-Length.
    let mut content_length: Option<usize> = None;
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside headers",
            ));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().ok();
            }
        }
    }

    // Read exactly Content-Length bytes, or the rest of the stream when
    // the header is absent.
    let body = match content_length {
        Some(len) => {
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body)?;
            body
        }
        None => {
            let mut body = Vec::new();
            reader.read_to_end(&mut body)?;
            body
        }
    };

    Ok(HttpResponse { status, body })
}

fn parse_status_line(line: &str) -> Option<u16> {
    // "HTTP/1.x <code> <reason>"
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// Percent-encodes a string for a form-urlencoded body.
pub fn form_urlencode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
