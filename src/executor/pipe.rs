//! Streams child output into the log as it arrives.

use std::io::{BufRead, BufReader, Read};

use strum::Display;

#[derive(Clone, Copy, Display)]
#[strum(serialize_all = "lowercase")]
pub(super) enum StreamType {
    Stdout,
    Stderr,
}

/// Reads a pipe line by line until EOF.
///
/// stdout goes to INFO and stderr to WARN so provisioning output is visible
/// with the default log level. A read error stops streaming but does not fail
/// the command; its exit status decides.
pub(super) fn read_pipe_to_log<R: Read>(pipe: Option<R>, stream: StreamType, label: &str) {
    let Some(pipe) = pipe else {
        tracing::error!(%stream, label, "pipe was not captured, no output will be logged");
        return;
    };

    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => log_line(line.strip_suffix(b"\n").unwrap_or(&line), stream, label),
            Err(e) => {
                tracing::error!(%stream, label, error = %e, "I/O error, stopping read");
                break;
            }
        }
    }
}

fn log_line(line: &[u8], stream: StreamType, label: &str) {
    let text = String::from_utf8_lossy(line);
    let text = text.trim_end_matches('\r');
    match stream {
        StreamType::Stdout => tracing::info!("[{}] {}", label, text),
        StreamType::Stderr => tracing::warn!("[{}] {}", label, text),
    }
}
