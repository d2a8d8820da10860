//! The line protocol spoken with `exiftool -stay_open True -@ -`.
//!
//! Requests go to stdin as one argument per line, closed by `-execute`.
//! Responses come back on stdout as a continuous stream in which every
//! finished command is followed by a `{ready}` line.

use crate::error::ExifToolError;
use std::borrow::Cow;
use std::io::{ErrorKind, Read};
use std::iter;
use std::path::Path;

/// Marker ExifTool prints on stdout after each `-execute`.
pub const READY_MARKER: &[u8] = b"{ready}";

const EXECUTE: &str = "-execute";
const CHUNK_SIZE: usize = 4096;

/// Lines that make a stay-open process leave its read loop and exit.
pub(crate) const SHUTDOWN: [&str; 3] = ["-stay_open", "False", EXECUTE];

/// Result of looking for one response at the front of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split<'a> {
    /// No complete `{ready}` line yet; read more and ask again.
    NeedMore,
    /// A response, and how many bytes of the buffer it used up.
    Frame { payload: &'a [u8], advance: usize },
    /// The response that ends the stream. Stop asking after this one.
    Final { payload: &'a [u8], advance: usize },
    /// The stream ended in the middle of a response.
    Truncated(&'a [u8]),
    /// The stream ended cleanly with nothing left over.
    Exhausted,
}

/// Finds the first response in `data`.
///
/// A `{ready}` only counts when a line ending (`\n` or `\r\n`) or the end of
/// the stream follows it, so binary payloads that happen to contain the
/// marker are not cut short. The line ending before the marker and the one
/// after it are part of the delimiter and never show up in the payload.
pub fn split_ready(data: &[u8], at_eof: bool) -> Split<'_> {
    split_ready_from(data, at_eof, 0)
}

/// [`split_ready`] that starts looking for the marker at `scan_from`.
///
/// The caller promises no delimiter starts before `scan_from`; the result is
/// then the same as `split_ready(data, at_eof)`. Lets a reader that grows its
/// buffer chunk by chunk look at each byte a bounded number of times.
pub fn split_ready_from(data: &[u8], at_eof: bool, scan_from: usize) -> Split<'_> {
    let mut from = scan_from.min(data.len());
    while let Some(offset) = find(&data[from..], READY_MARKER) {
        let start = from + offset;
        let end = start + READY_MARKER.len();
        let advance = match (&data[end..], at_eof) {
            ([], false) | ([b'\r'], false) => return Split::NeedMore,
            ([], true) => Some(end),
            ([b'\r'], true) => Some(end + 1),
            ([b'\n', ..], _) => Some(end + 1),
            ([b'\r', b'\n', ..], _) => Some(end + 2),
            _ => None,
        };

        match advance {
            Some(advance) => {
                let payload = strip_line_ending(&data[..start]);
                return if at_eof && advance == data.len() {
                    Split::Final { payload, advance }
                } else {
                    Split::Frame { payload, advance }
                };
            }
            None => from = start + 1,
        }
    }

    match (at_eof, data.is_empty()) {
        (false, _) => Split::NeedMore,
        (true, true) => Split::Exhausted,
        (true, false) => Split::Truncated(data),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn strip_line_ending(data: &[u8]) -> &[u8] {
    data.strip_suffix(b"\r\n")
        .or_else(|| data.strip_suffix(b"\n"))
        .unwrap_or(data)
}

/// Pulls `{ready}`-delimited responses out of a byte stream.
pub struct FrameReader<R> {
    inner: R,
    buffer: Vec<u8>,
    /// Everything before this offset has been searched without finding a
    /// delimiter.
    scanned: usize,
    at_eof: bool,
    finished: bool,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::with_capacity(CHUNK_SIZE),
            scanned: 0,
            at_eof: false,
            finished: false,
        }
    }

    /// Blocks until the next response is complete.
    ///
    /// Returns `Ok(None)` once the stream has ended cleanly, and
    /// `ExifToolError::Truncated` with the leftover bytes when it ended
    /// halfway through a response.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ExifToolError> {
        if self.finished {
            return Ok(None);
        }

        loop {
            let step = match split_ready_from(&self.buffer, self.at_eof, self.scanned) {
                Split::NeedMore => None,
                Split::Frame { payload, advance } => Some(Ok((payload.to_vec(), advance, false))),
                Split::Final { payload, advance } => Some(Ok((payload.to_vec(), advance, true))),
                Split::Truncated(rest) => Some(Err(rest.to_vec())),
                Split::Exhausted => {
                    self.finished = true;
                    return Ok(None);
                }
            };

            match step {
                None => {
                    // A marker still waiting for its line ending starts at
                    // most this far back.
                    self.scanned = self
                        .buffer
                        .len()
                        .saturating_sub(READY_MARKER.len() + 1);
                    self.fill()?
                }
                Some(Ok((frame, advance, last))) => {
                    self.buffer.drain(..advance);
                    self.scanned = 0;
                    self.finished = last;
                    return Ok(Some(frame));
                }
                Some(Err(partial)) => {
                    self.buffer.clear();
                    self.scanned = 0;
                    self.finished = true;
                    return Err(ExifToolError::Truncated { partial });
                }
            }
        }
    }

    fn fill(&mut self) -> Result<(), ExifToolError> {
        let mut chunk = [0u8; CHUNK_SIZE];
        let bytes_read = loop {
            match self.inner.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ExifToolError::Read(e)),
            }
        };

        if bytes_read == 0 {
            self.at_eof = true;
        } else {
            self.buffer.extend_from_slice(&chunk[..bytes_read]);
        }
        Ok(())
    }
}

/// Builds the lines for one request: default args, extra args, the file
/// name, then `-execute`.
///
/// Every line must survive the trip as exactly one line, so anything holding
/// a line break or another control character is refused before it reaches
/// the process. A relative file name starting with `-` gets a `./` prefix so
/// ExifTool reads it as a file and not as an option such as `-execute`.
pub fn request_lines(
    default_args: &[String],
    extra_args: &[&str],
    file_path: &Path,
) -> Result<Vec<String>, ExifToolError> {
    let file_name = file_path
        .to_str()
        .ok_or_else(|| ExifToolError::InvalidInput {
            value: file_path.to_string_lossy().into_owned(),
            reason: "path is not valid UTF-8",
        })?;
    if file_name.is_empty() {
        return Err(ExifToolError::InvalidInput {
            value: String::new(),
            reason: "file name is empty",
        });
    }

    let file_name = if file_name.starts_with('-') {
        Cow::Owned(format!("./{file_name}"))
    } else {
        Cow::Borrowed(file_name)
    };

    let mut lines = Vec::with_capacity(default_args.len() + extra_args.len() + 2);
    let args = default_args
        .iter()
        .map(String::as_str)
        .chain(extra_args.iter().copied())
        .chain(iter::once(file_name.as_ref()));
    for arg in args {
        check_line(arg)?;
        lines.push(arg.to_string());
    }
    lines.push(EXECUTE.to_string());
    Ok(lines)
}

fn check_line(value: &str) -> Result<(), ExifToolError> {
    let reason = if value.contains(|c: char| c == '\n' || c == '\r') {
        "contains a line break"
    } else if value.chars().any(|c| c.is_control() && c != '\t') {
        "contains a control character"
    } else {
        return Ok(());
    };
    Err(ExifToolError::InvalidInput {
        value: value.to_string(),
        reason,
    })
}
