//! Last-line reader for encoder logs.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Bytes read from the end of a log when looking for its last line.
pub const TAIL_WINDOW: u64 = 1024;

/// Return the last non-empty line of the file at `path`, trimmed.
///
/// Only the final [`TAIL_WINDOW`] bytes are read. If they contain no line
/// terminator, the whole window is returned. ffmpeg ends progress updates
/// with `\r`, so both `\r` and `\n` count as terminators.
pub fn tail_log(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(String::new());
    }

    let window = len.min(TAIL_WINDOW);
    file.seek(SeekFrom::Start(len - window))?;
    let mut buf = Vec::with_capacity(window as usize);
    file.take(window).read_to_end(&mut buf)?;

    Ok(last_line(&buf))
}

fn last_line(buf: &[u8]) -> String {
    let end = buf
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    let content = &buf[..end];
    let start = content
        .iter()
        .rposition(|&b| b == b'\n' || b == b'\r')
        .map_or(0, |i| i + 1);
    String::from_utf8_lossy(&content[start..]).trim().to_string()
}
