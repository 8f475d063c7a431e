//! Line readers for subprocess output streams

use crate::events::LogOrigin;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::debug;

/// Routine ffmpeg diagnostics that are dropped instead of forwarded
pub const TRANSCODER_NOISE: &[&str] = &[
    "non-existing PPS",
    "Invalid NAL unit size",
    "Error splitting the input into NAL units",
    "deprecated pixel format used",
    "decode_slice_header error",
    "no frame!",
    "Last message repeated",
    "concealing",
    "Missing reference picture",
    "co located POCs unavailable",
    "non monotonically increasing dts",
];

/// Check whether a line matches one of the noise patterns
pub fn is_noise(line: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| line.contains(p))
}

/// Read `reader` line by line, forwarding every line not matched by `noise`
///
/// Runs until the stream closes or a read fails. Line terminators are
/// trimmed and bytes that are not valid UTF-8 are replaced, so a stray
/// Latin-1 title does not end the stream.
pub fn spawn_line_pump<R, F>(
    reader: R,
    origin: LogOrigin,
    noise: &'static [&'static str],
    mut forward: F,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: FnMut(LogOrigin, String) + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    let line = text.trim_end_matches(|c: char| c == '\n' || c == '\r');
                    if is_noise(line, noise) {
                        continue;
                    }
                    forward(origin, line.to_string());
                }
                Err(e) => {
                    debug!(origin = origin.as_str(), error = %e, "output stream read failed");
                    break;
                }
            }
        }
    })
}
