use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Recordings are split into snippets of this many seconds, which the native
/// layer joins once the recording completes.
pub const SNIPPET_SECONDS: u32 = 15;

/// Snippet length in samples for the given sample rate.
pub fn snippet_buffer_size(sample_rate: u32) -> usize {
    SNIPPET_SECONDS as usize * sample_rate as usize
}

/// Request to record the engine output to a file while it plays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingRequest {
    pub output_path: PathBuf,
    pub snippet_size: usize,
}

impl RecordingRequest {
    pub fn new(output_path: impl Into<PathBuf>, sample_rate: u32) -> Self {
        Self {
            output_path: output_path.into(),
            snippet_size: snippet_buffer_size(sample_rate),
        }
    }
}

/// Request to record the device input to a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecordingRequest {
    pub output_path: PathBuf,
    pub snippet_size: usize,
    /// Record the raw input, bypassing the input channel's processing chain.
    pub skip_processing: bool,
}

impl InputRecordingRequest {
    pub fn new(output_path: impl Into<PathBuf>, sample_rate: u32, skip_processing: bool) -> Self {
        Self {
            output_path: output_path.into(),
            snippet_size: snippet_buffer_size(sample_rate),
            skip_processing,
        }
    }
}

/// Request to record the engine output mixed with the device input, the
/// input shifted back by the measured round trip latency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullDuplexRequest {
    pub output_path: PathBuf,
    pub snippet_size: usize,
    pub roundtrip_latency: Duration,
}

impl FullDuplexRequest {
    pub fn new(output_path: impl Into<PathBuf>, sample_rate: u32, roundtrip_latency: Duration) -> Self {
        Self {
            output_path: output_path.into(),
            snippet_size: snippet_buffer_size(sample_rate),
            roundtrip_latency,
        }
    }

    /// Latency compensation in samples at `sample_rate`.
    pub fn latency_samples(&self, sample_rate: u32) -> usize {
        (self.roundtrip_latency.as_secs_f64() * sample_rate as f64).round() as usize
    }
}

/// Request to render a range of the sequencer to a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BounceRequest {
    pub output_path: PathBuf,
    /// Sample range to bounce.
    pub range: Range<usize>,
    pub snippet_size: usize,
}

impl BounceRequest {
    pub fn new(output_path: impl Into<PathBuf>, range: Range<usize>, sample_rate: u32) -> Self {
        Self {
            output_path: output_path.into(),
            range,
            snippet_size: snippet_buffer_size(sample_rate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippets_hold_fifteen_seconds() {
        assert_eq!(snippet_buffer_size(44_100), 661_500);
        assert_eq!(RecordingRequest::new("take.wav", 8_000).snippet_size, 120_000);
        assert_eq!(
            InputRecordingRequest::new("mic.wav", 8_000, true).snippet_size,
            120_000
        );
    }

    #[test]
    fn duplex_latency_converts_to_samples() {
        let request = FullDuplexRequest::new("duet.wav", 48_000, Duration::from_millis(25));
        assert_eq!(request.latency_samples(48_000), 1_200);
        assert_eq!(request.latency_samples(8_000), 200);
    }
}
