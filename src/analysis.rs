//! Hands finished channel data to an external analysis process over its
//! stdin. The handoff is best-effort: the child is spawned per channel,
//! given one line of input, and never waited on. A child that reads
//! slowly (or not at all) must not stall record finalization, so the
//! write happens on a throwaway thread with a short deadline.

use log::debug;
use std::fmt::{self, Display};
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// How long finalization waits for the child to accept its input line.
pub const HANDOFF_TIMEOUT: Duration = Duration::from_secs(1);

/// Failures spawning the analysis child.
#[derive(Debug)]
pub enum AnalysisError {
    /// The command could not be started.
    Spawn(std::io::Error),
    /// The child was started without a usable stdin pipe.
    NoStdin,
}

impl Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AnalysisError::Spawn(e) => write!(f, "could not start analysis command: {e}"),
            AnalysisError::NoStdin => write!(f, "analysis child has no stdin"),
        }
    }
}

impl std::error::Error for AnalysisError {}

/// Formats one channel as the single input line the analysis process
/// expects: frequency, label, then the samples as a bracketed list.
pub fn handoff_line(frequency_hz: u32, label: &str, samples: &[f32]) -> String {
    format!("{},{},{:?}", frequency_hz, label, samples)
}

/// Spawns `command` and writes one channel's handoff line to its stdin.
///
/// Output is discarded and the child is left to run on its own. If the
/// child has not accepted the line within [`HANDOFF_TIMEOUT`] the writer
/// thread is abandoned with it; that is not reported as an error.
pub fn spawn_analysis(
    command: &str,
    frequency_hz: u32,
    label: &str,
    samples: &[f32],
) -> Result<(), AnalysisError> {
    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        return Err(AnalysisError::Spawn(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty command",
        )));
    };

    let mut child = Command::new(program)
        .args(parts)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(AnalysisError::Spawn)?;

    let mut stdin = child.stdin.take().ok_or(AnalysisError::NoStdin)?;
    let line = handoff_line(frequency_hz, label, samples);

    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let result = writeln!(stdin, "{line}");
        let _ = done_tx.send(result);
    });

    match done_rx.recv_timeout(HANDOFF_TIMEOUT) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("analysis child closed stdin early: {e}"),
        Err(_) => debug!("analysis child did not accept input within the deadline"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handoff_line_matches_the_expected_shape() {
        let line = handoff_line(2000, "sensor1 CH 1", &[0.0, 1.65, 3.3]);
        assert_eq!(line, "2000,sensor1 CH 1,[0.0, 1.65, 3.3]");
    }

    #[test]
    fn handoff_line_with_no_samples() {
        assert_eq!(handoff_line(1000, "x", &[]), "1000,x,[]");
    }

    #[test]
    fn missing_command_is_a_spawn_error() {
        let err = spawn_analysis("definitely-not-a-real-binary-1f2e3d", 1000, "x", &[0.0])
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Spawn(_)));
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = spawn_analysis("   ", 1000, "x", &[]).unwrap_err();
        assert!(matches!(err, AnalysisError::Spawn(_)));
    }

    #[cfg(unix)]
    #[test]
    fn a_sink_child_accepts_the_handoff() {
        spawn_analysis("cat", 1000, "sensor1 CH 1", &[0.1, 0.2]).unwrap();
    }
}
