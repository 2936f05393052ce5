//! Turns the per-device sample buffers left over at the end of a capture
//! into one time-aligned, exportable record. The devices terminate their
//! streams independently, so the buffers rarely agree on length; the
//! record is always truncated to the shortest buffer (and never past what
//! the capture parameters promised), never padded.

use crate::session::SampleBuffer;
use csv::Writer;
use std::fmt::{self, Display};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// One device's reconciled contribution to the record.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTrace {
    /// Device name, used for the record header.
    pub name: String,
    /// Synthetic time base, `i / frequency` per sample.
    pub time_base: Vec<f64>,
    /// Per-channel voltages, truncated to the common length.
    pub channels: Vec<Vec<f32>>,
}

/// The reconciled capture, ready to be written or handed to analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRecord {
    /// Sampling frequency the capture ran at, in Hz.
    pub frequency_hz: u32,
    /// Common sample count across every device and channel.
    pub len: usize,
    /// One trace per device, in registration order.
    pub traces: Vec<DeviceTrace>,
}

/// Failures while writing the record out.
#[derive(Debug)]
pub enum RecordError {
    /// Filesystem error.
    Io(std::io::Error),
    /// Delimited-text encoding error.
    Csv(csv::Error),
}

impl Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordError::Io(e) => write!(f, "io error: {e}"),
            RecordError::Csv(e) => write!(f, "csv error: {e}"),
        }
    }
}

impl std::error::Error for RecordError {}

impl From<std::io::Error> for RecordError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<csv::Error> for RecordError {
    fn from(value: csv::Error) -> Self {
        Self::Csv(value)
    }
}

/// Aligns the per-device buffers to a common length.
///
/// The final length is the shorter of what the parameters promised
/// (`duration * frequency`) and what was actually received (the shortest
/// buffer). Excess samples from a faster-reporting device are silently
/// dropped. Each device's time base is regenerated as a clean `i /
/// frequency` series, replacing the noisy raw device timestamps.
pub fn reconcile(
    buffers: Vec<(String, SampleBuffer)>,
    duration_s: u32,
    frequency_hz: u32,
) -> CaptureRecord {
    let expected = duration_s as usize * frequency_hz as usize;
    let actual = buffers.iter().map(|(_, b)| b.len()).min().unwrap_or(0);
    let len = expected.min(actual);

    let time_base: Vec<f64> = (0..len).map(|i| i as f64 / frequency_hz as f64).collect();

    let traces = buffers
        .into_iter()
        .map(|(name, buffer)| {
            let channels = buffer
                .channels
                .into_iter()
                .map(|mut samples| {
                    samples.truncate(len);
                    samples
                })
                .collect();
            DeviceTrace {
                name,
                time_base: time_base.clone(),
                channels,
            }
        })
        .collect();

    CaptureRecord {
        frequency_hz,
        len,
        traces,
    }
}

impl CaptureRecord {
    /// Writes the record as delimited text: a device-name header row, a
    /// `Time, CH1, ...` sub-header, then one row per sample index with
    /// each device's time and channel values interleaved.
    pub fn write_to<W: Write>(&self, sink: W) -> Result<(), RecordError> {
        let mut writer = Writer::from_writer(sink);

        // Row 1: device names, padded so the columns line up with row 2.
        let mut header = Vec::new();
        for trace in &self.traces {
            header.push(trace.name.clone());
            for _ in &trace.channels {
                header.push(String::new());
            }
        }
        writer.write_record(&header)?;

        let mut sub_header = Vec::new();
        for trace in &self.traces {
            sub_header.push("Time".to_owned());
            for ch in 0..trace.channels.len() {
                sub_header.push(format!("CH{}", ch + 1));
            }
        }
        writer.write_record(&sub_header)?;

        for i in 0..self.len {
            let mut row = Vec::new();
            for trace in &self.traces {
                row.push(trace.time_base[i].to_string());
                for channel in &trace.channels {
                    row.push(channel[i].to_string());
                }
            }
            writer.write_record(&row)?;
        }

        writer.flush()?;
        Ok(())
    }

    /// Writes the record to a file at `path`.
    pub fn write_to_path(&self, path: impl AsRef<Path>) -> Result<(), RecordError> {
        let file = File::create(path)?;
        self.write_to(file)
    }
}
