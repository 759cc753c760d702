//! Minimal shuffle daemon for integration tests.
//!
//! Accepts the signed mapOutput GET, answers with a reply hash, then writes
//! the configured frames back-to-back. Fault injection: a corrupt reply
//! hash, raw bytes spliced into the stream, or a stall that holds the
//! connection open without writing.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use shufetch_core::auth::{ShuffleSecret, REPLY_HASH_HEADER, URL_HASH_HEADER};
use shufetch_core::wire::ShuffleHeader;

/// One attempt's bytes as the daemon serves them.
#[derive(Clone)]
pub struct Served {
    pub path_component: String,
    pub partition: i32,
    /// Payload bytes on the wire (already compressed if a codec is in play).
    pub payload: Vec<u8>,
    /// Uncompressed length declared in the header.
    pub uncompressed_len: i64,
}

impl Served {
    /// An uncompressed attempt: wire bytes and declared length coincide.
    pub fn plain(path_component: &str, partition: i32, payload: &[u8]) -> Self {
        Self {
            path_component: path_component.to_string(),
            partition,
            payload: payload.to_vec(),
            uncompressed_len: payload.len() as i64,
        }
    }
}

/// What goes on the wire after the response head.
#[derive(Clone)]
pub enum Frame {
    Attempt(Served),
    /// Bytes spliced verbatim into the stream.
    Raw(Vec<u8>),
    /// Stop writing and hold the connection open.
    Stall,
}

#[derive(Clone, Copy, Default)]
pub struct ShuffleServerOptions {
    /// Answer with a reply hash computed from the wrong secret.
    pub corrupt_reply_hash: bool,
}

/// Starts a daemon in a background thread. Returns (host, port). The
/// listener runs until the process exits.
pub fn start(
    secret: ShuffleSecret,
    frames: Vec<Frame>,
    opts: ShuffleServerOptions,
) -> (String, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let secret = secret.clone();
            let frames = frames.clone();
            thread::spawn(move || handle(stream, &secret, &frames, opts));
        }
    });
    ("127.0.0.1".to_string(), port)
}

/// An address nothing listens on: bind an ephemeral port, then free it.
pub fn refused_addr() -> (String, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    ("127.0.0.1".to_string(), port)
}

fn handle(stream: TcpStream, secret: &ShuffleSecret, frames: &[Frame], opts: ShuffleServerOptions) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let mut reader = BufReader::new(stream);

    let mut url_hash = String::new();
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case(URL_HASH_HEADER) {
                url_hash = value.trim().to_string();
            }
        }
    }

    let reply = if opts.corrupt_reply_hash {
        ShuffleSecret::new(b"wrong-secret".to_vec()).reply_hash(&url_hash)
    } else {
        secret.reply_hash(&url_hash)
    };

    let mut stream = reader.into_inner();
    let head = format!(
        "HTTP/1.1 200 OK\r\n{}: {}\r\nConnection: close\r\n\r\n",
        REPLY_HASH_HEADER, reply
    );
    if stream.write_all(head.as_bytes()).is_err() {
        return;
    }

    for frame in frames {
        match frame {
            Frame::Attempt(served) => {
                let header = ShuffleHeader {
                    path_component: served.path_component.clone(),
                    compressed_len: served.payload.len() as i64,
                    uncompressed_len: served.uncompressed_len,
                    partition: served.partition,
                };
                let mut wire = Vec::new();
                header.write_to(&mut wire).expect("encode header");
                wire.extend_from_slice(&served.payload);
                if stream.write_all(&wire).is_err() {
                    return;
                }
            }
            Frame::Raw(bytes) => {
                if stream.write_all(bytes).is_err() {
                    return;
                }
            }
            Frame::Stall => {
                let _ = stream.flush();
                thread::sleep(Duration::from_secs(30));
                return;
            }
        }
        let _ = stream.flush();
    }
}
