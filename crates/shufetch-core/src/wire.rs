//! Per-attempt wire framing on the response body.
//!
//! Each attempt is a fixed header (length-prefixed path component, the two
//! payload lengths, the partition; all big-endian) followed by exactly
//! `compressed_len` payload bytes.

use flate2::read::ZlibDecoder;
use std::fmt;
use std::io::{self, BufReader, Read, Write};

/// Upper bound on a sane path component; a larger prefix means the stream
/// cursor is not sitting on a header.
pub const MAX_PATH_COMPONENT_LEN: usize = 4096;

/// Header preceding each attempt's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleHeader {
    pub path_component: String,
    pub compressed_len: i64,
    pub uncompressed_len: i64,
    pub partition: i32,
}

/// Failure reading a header. `BadHeader` means the framing itself cannot be
/// trusted; `Io` means the stream died underneath us.
#[derive(Debug)]
pub enum HeaderError {
    BadHeader(String),
    Io(io::Error),
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderError::BadHeader(msg) => write!(f, "bad shuffle header: {}", msg),
            HeaderError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for HeaderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HeaderError::Io(e) => Some(e),
            HeaderError::BadHeader(_) => None,
        }
    }
}

impl From<io::Error> for HeaderError {
    fn from(e: io::Error) -> Self {
        HeaderError::Io(e)
    }
}

impl ShuffleHeader {
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, HeaderError> {
        let len = read_u32(r)? as usize;
        if len == 0 || len > MAX_PATH_COMPONENT_LEN {
            return Err(HeaderError::BadHeader(format!(
                "path component length {} out of range",
                len
            )));
        }
        let mut raw = vec![0u8; len];
        r.read_exact(&mut raw)?;
        let path_component = String::from_utf8(raw)
            .map_err(|_| HeaderError::BadHeader("path component is not UTF-8".to_string()))?;
        let compressed_len = read_i64(r)?;
        let uncompressed_len = read_i64(r)?;
        let partition = read_i32(r)?;
        Ok(Self {
            path_component,
            compressed_len,
            uncompressed_len,
            partition,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        if self.path_component.len() > MAX_PATH_COMPONENT_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "path component too long",
            ));
        }
        w.write_all(&(self.path_component.len() as u32).to_be_bytes())?;
        w.write_all(self.path_component.as_bytes())?;
        w.write_all(&self.compressed_len.to_be_bytes())?;
        w.write_all(&self.uncompressed_len.to_be_bytes())?;
        w.write_all(&self.partition.to_be_bytes())?;
        Ok(())
    }
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_i32<R: Read>(r: &mut R) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

fn read_i64<R: Read>(r: &mut R) -> io::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

/// Codec the producers compressed payloads with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Zlib,
}

impl Codec {
    pub fn from_name(name: &str) -> Option<Codec> {
        match name {
            "zlib" | "deflate" => Some(Codec::Zlib),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::Zlib => "zlib",
        }
    }
}

/// Stream one attempt's payload into a reserved memory buffer, decompressing
/// when a codec is set. Reads exactly `compressed_len` bytes off `input` and
/// fills `buf` exactly; anything else is an I/O error. `read_ahead` sizes an
/// intermediate buffer for the decoder and changes no observable framing.
pub fn shuffle_to_memory<R: Read>(
    buf: &mut [u8],
    input: &mut R,
    compressed_len: u64,
    codec: Option<Codec>,
    read_ahead: Option<usize>,
) -> io::Result<()> {
    let mut framed = input.take(compressed_len);
    match codec {
        Some(Codec::Zlib) => match read_ahead {
            Some(cap) => decode_exact(
                buf,
                ZlibDecoder::new(BufReader::with_capacity(cap.max(512), &mut framed)),
            )?,
            None => decode_exact(buf, ZlibDecoder::new(&mut framed))?,
        },
        None => framed.read_exact(buf)?,
    }
    // Drain whatever the decoder left inside the frame so the next header
    // starts at the right offset.
    let leftover = io::copy(&mut framed, &mut io::sink())?;
    if leftover > 0 {
        if codec.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} trailing bytes after uncompressed payload", leftover),
            ));
        }
        tracing::debug!(leftover, "compressed frame larger than decoded payload");
    }
    Ok(())
}

fn decode_exact<R: Read>(buf: &mut [u8], mut decoder: R) -> io::Result<()> {
    decoder.read_exact(buf)?;
    let mut probe = [0u8; 1];
    if decoder.read(&mut probe)? != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "decompressed payload exceeds the declared length",
        ));
    }
    Ok(())
}

/// Copy exactly `compressed_len` payload bytes verbatim to the on-disk
/// destination; the merger decompresses on read.
pub fn shuffle_to_disk<R: Read, W: Write>(
    output: &mut W,
    input: &mut R,
    compressed_len: u64,
) -> io::Result<()> {
    let mut framed = input.take(compressed_len);
    let copied = io::copy(&mut framed, output)?;
    if copied != compressed_len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("disk copy ended after {} of {} bytes", copied, compressed_len),
        ));
    }
    output.flush()
}
