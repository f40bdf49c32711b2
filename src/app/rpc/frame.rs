use std::fmt;
use std::io::{self, Read, Write};

use crate::app::error::AppError;
use crate::app::rpc::envelope::Envelope;

/// Largest payload a 2-byte length prefix can describe.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

#[derive(Debug)]
pub enum FrameError {
    Io(io::Error),
    TooLarge(usize),
    Utf8,
    Json(serde_json::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Io(err) => write!(f, "frame io error: {err}"),
            FrameError::TooLarge(len) => {
                write!(f, "frame of {len} bytes exceeds {MAX_FRAME_LEN}")
            }
            FrameError::Utf8 => write!(f, "frame is not valid utf-8"),
            FrameError::Json(err) => write!(f, "frame is not a valid envelope: {err}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        FrameError::Io(err)
    }
}

impl From<serde_json::Error> for FrameError {
    fn from(err: serde_json::Error) -> Self {
        FrameError::Json(err)
    }
}

impl FrameError {
    pub fn into_app_error(self, trace_id: &str) -> AppError {
        AppError::protocol(self.to_string(), trace_id)
    }
}

/// Escapes every non-ASCII character as `\uXXXX` so the payload is byte-identical
/// under UTF-8 and the JVM's modified UTF-8.
fn ascii_json(json: &str) -> String {
    if json.is_ascii() {
        return json.to_string();
    }
    let mut out = String::with_capacity(json.len() + 16);
    for ch in json.chars() {
        if ch.is_ascii() {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    out
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &str) -> Result<(), FrameError> {
    let bytes = payload.as_bytes();
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(bytes.len()));
    }
    let len = bytes.len() as u16;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(bytes)?;
    writer.flush()?;
    Ok(())
}

/// Returns `Ok(None)` when the stream ends cleanly before a length prefix.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<String>, FrameError> {
    let mut prefix = [0u8; 2];
    let mut filled = 0;
    while filled < prefix.len() {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(FrameError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a length prefix",
                )))
            }
            Ok(count) => filled += count,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
    let len = u16::from_be_bytes(prefix) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    String::from_utf8(payload)
        .map(Some)
        .map_err(|_| FrameError::Utf8)
}

pub fn write_envelope<W: Write>(writer: &mut W, envelope: &Envelope) -> Result<(), FrameError> {
    let json = serde_json::to_string(envelope)?;
    write_frame(writer, &ascii_json(&json))
}

pub fn read_envelope<R: Read>(reader: &mut R) -> Result<Option<Envelope>, FrameError> {
    match read_frame(reader)? {
        Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
        None => Ok(None),
    }
}
