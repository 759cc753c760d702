//! Blocking HTTP connection to the shuffle daemon.
//!
//! One request per batch: connect, send the signed GET, then read the
//! status line and headers and verify the daemon's reply hash before any
//! body byte is trusted. The body reader is handed to the wire framer.
//! A cloned socket handle allows another thread to break a blocked read.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;
use url::Url;

use crate::attempt::InputAttemptId;
use crate::auth::{ShuffleSecret, REPLY_HASH_HEADER, URL_HASH_HEADER};

const MAX_HEADER_LINE: usize = 8 * 1024;

/// Per-connection tuning; derived from the config.
#[derive(Debug, Clone, Copy)]
pub struct HttpParams {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub keep_alive: bool,
}

impl Default for HttpParams {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            keep_alive: false,
        }
    }
}

/// The mapOutput request URL for one batch.
#[derive(Debug, Clone)]
pub struct ShuffleUrl {
    url: Url,
}

impl ShuffleUrl {
    /// `{http|https}://host:port/mapOutput?job=…&reduce=…&map=pc1,pc2,…`
    /// with a keep-alive hint when configured. Path components travel
    /// comma-joined, in batch order.
    pub fn build(
        host: &str,
        port: u16,
        partition: u32,
        job_id: &str,
        attempts: &[InputAttemptId],
        secure: bool,
        keep_alive: bool,
    ) -> anyhow::Result<ShuffleUrl> {
        let scheme = if secure { "https" } else { "http" };
        let maps: Vec<&str> = attempts.iter().map(|a| a.path_component()).collect();
        let mut raw = format!(
            "{}://{}:{}/mapOutput?job={}&reduce={}&map={}",
            scheme,
            host,
            port,
            job_id,
            partition,
            maps.join(",")
        );
        if keep_alive {
            raw.push_str("&keepAlive=true");
        }
        let url = Url::parse(&raw)?;
        Ok(ShuffleUrl { url })
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url.port().unwrap_or(if self.is_secure() { 443 } else { 80 })
    }

    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// The part of the URL the request MAC covers.
    pub fn path_and_query(&self) -> &str {
        &self.url[url::Position::BeforePath..]
    }
}

impl fmt::Display for ShuffleUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Cloned socket handle used to break a blocking read from another thread.
#[derive(Debug)]
pub struct CancelHandle(TcpStream);

impl CancelHandle {
    pub fn close(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}

pub struct HttpConnection {
    url: ShuffleUrl,
    params: HttpParams,
    url_hash: String,
    log_id: String,
    stream: Option<TcpStream>,
    reader: Option<BufReader<TcpStream>>,
}

impl HttpConnection {
    pub fn new(url: ShuffleUrl, params: HttpParams, secret: &ShuffleSecret, log_id: &str) -> Self {
        let url_hash = secret.hash_url(url.path_and_query());
        Self {
            url,
            params,
            url_hash,
            log_id: log_id.to_string(),
            stream: None,
            reader: None,
        }
    }

    /// Resolve, connect and send the signed request. Any failure here is a
    /// host-level connect error.
    pub fn connect(&mut self) -> io::Result<()> {
        if self.url.is_secure() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "https transport is not built in; terminate TLS in front of the daemon",
            ));
        }
        let host = self.url.host().to_string();
        let port = self.url.port();
        let addrs: Vec<_> = (host.as_str(), port).to_socket_addrs()?.collect();
        let mut last_err = None;
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.params.connect_timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let stream = match stream {
            Some(s) => s,
            None => {
                return Err(last_err.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {}", host))
                }))
            }
        };
        stream.set_read_timeout(Some(self.params.read_timeout))?;
        stream.set_write_timeout(Some(self.params.read_timeout))?;
        stream.set_nodelay(true)?;

        let connection = if self.params.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}:{}\r\n{}: {}\r\nConnection: {}\r\n\r\n",
            self.url.path_and_query(),
            host,
            port,
            URL_HASH_HEADER,
            self.url_hash,
            connection
        );
        let mut stream = stream;
        stream.write_all(request.as_bytes())?;
        stream.flush()?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Handle another thread can use to break a read blocked on this
    /// connection. Take it after `connect`; it stays valid across `open`.
    pub fn cancel_handle(&self) -> Option<CancelHandle> {
        self.stream
            .as_ref()
            .and_then(|s| s.try_clone().ok())
            .map(CancelHandle)
    }

    /// Read the response head and verify the daemon's reply hash. Failures
    /// here mean the first attempt of the batch is suspect.
    pub fn open(&mut self, secret: &ShuffleSecret) -> io::Result<()> {
        let stream = self.stream.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "connection not established")
        })?;
        let mut reader = BufReader::new(stream);

        let status = read_line(&mut reader)?;
        let code = status
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("malformed status line: {:?}", status),
                )
            })?;
        if code != 200 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("shuffle daemon answered HTTP {}", code),
            ));
        }

        let mut headers = Vec::new();
        loop {
            let line = read_line(&mut reader)?;
            if line.is_empty() {
                break;
            }
            headers.push(line);
        }

        match header_value(&headers, REPLY_HASH_HEADER) {
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("reply carries no {} header", REPLY_HASH_HEADER),
                ));
            }
            Some(reply) if !secret.verify_reply(&self.url_hash, reply) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "reply hash does not verify against the shuffle secret",
                ));
            }
            Some(_) => {}
        }
        tracing::debug!("{} validated response from {}", self.log_id, self.url);
        self.reader = Some(reader);
        Ok(())
    }

    /// Buffered body reader; valid after `open`.
    pub fn body(&mut self) -> io::Result<&mut BufReader<TcpStream>> {
        self.reader.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "response stream not open")
        })
    }
}

/// One CRLF-terminated line of the response head.
fn read_line(reader: &mut impl BufRead) -> io::Result<String> {
    let mut raw = Vec::new();
    let n = reader
        .by_ref()
        .take(MAX_HEADER_LINE as u64)
        .read_until(b'\n', &mut raw)?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed while reading response head",
        ));
    }
    if !raw.ends_with(b"\n") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "response header line too long",
        ));
    }
    while raw.last() == Some(&b'\n') || raw.last() == Some(&b'\r') {
        raw.pop();
    }
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

fn header_value<'a>(lines: &'a [String], name: &str) -> Option<&'a str> {
    lines.iter().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        if k.trim().eq_ignore_ascii_case(name) {
            Some(v.trim())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempts() -> Vec<InputAttemptId> {
        vec![
            InputAttemptId::new(0, 0, "m_0_0"),
            InputAttemptId::new(1, 0, "m_1_0"),
        ]
    }

    #[test]
    fn url_carries_batch_in_order() {
        let url =
            ShuffleUrl::build("node1", 13562, 4, "job_17", &attempts(), false, false).unwrap();
        assert_eq!(
            url.path_and_query(),
            "/mapOutput?job=job_17&reduce=4&map=m_0_0,m_1_0"
        );
        assert_eq!(url.host(), "node1");
        assert_eq!(url.port(), 13562);
        assert!(!url.is_secure());
    }

    #[test]
    fn keep_alive_hint_is_appended() {
        let url = ShuffleUrl::build("node1", 13562, 0, "j", &attempts(), false, true).unwrap();
        assert!(url.path_and_query().ends_with("&keepAlive=true"));
    }

    #[test]
    fn encrypted_transfer_selects_https() {
        let url = ShuffleUrl::build("node1", 13562, 0, "j", &attempts(), true, false).unwrap();
        assert!(url.is_secure());
        assert!(url.to_string().starts_with("https://"));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let lines = vec![
            "Content-Length: 10".to_string(),
            "X-Shuffle-Reply-Hash: abc".to_string(),
        ];
        assert_eq!(header_value(&lines, REPLY_HASH_HEADER), Some("abc"));
        assert_eq!(header_value(&lines, "content-length"), Some("10"));
        assert_eq!(header_value(&lines, "x-missing"), None);
    }

    #[test]
    fn read_line_strips_crlf() {
        let mut cursor = std::io::Cursor::new(b"HTTP/1.1 200 OK\r\nnext".to_vec());
        assert_eq!(read_line(&mut cursor).unwrap(), "HTTP/1.1 200 OK");
    }

    #[test]
    fn read_line_errors_at_eof() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        assert!(read_line(&mut cursor).is_err());
    }
}
