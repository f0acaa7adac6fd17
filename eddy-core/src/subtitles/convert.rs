//! Subtitle format conversion to WebVTT.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::SubtitleError;

const BOM: char = '\u{feff}';

static SRT_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,2}):(\d{2}):(\d{2})[,.](\d{1,3})").expect("timestamp pattern compiles")
});

/// Text subtitle formats the bridge understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtitleFormat {
    Srt,
    Vtt,
}

impl SubtitleFormat {
    /// Guesses the format from a file name, defaulting to SRT.
    pub fn from_file_name(name: &str) -> Self {
        if name.to_ascii_lowercase().ends_with(".vtt") {
            Self::Vtt
        } else {
            Self::Srt
        }
    }
}

/// Decodes subtitle bytes, falling back to Latin-1 for legacy SRT files.
pub fn decode_subtitle_bytes(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(text) => text.to_string(),
        Err(_) => raw.iter().map(|byte| char::from(*byte)).collect(),
    }
}

/// Converts subtitle text into WebVTT.
///
/// WebVTT input passes through with only BOM and line endings normalized.
/// SRT timing lines have their millisecond separator rewritten and cue
/// numbers are kept as cue identifiers.
///
/// # Errors
/// - `SubtitleError::InvalidFormat` - No cue timing line found
pub fn to_webvtt(text: &str) -> Result<(String, SubtitleFormat), SubtitleError> {
    let normalized = text
        .trim_start_matches(BOM)
        .replace("\r\n", "\n")
        .replace('\r', "\n");

    if normalized.starts_with("WEBVTT") {
        return Ok((normalized, SubtitleFormat::Vtt));
    }

    let mut output = String::with_capacity(normalized.len() + 8);
    output.push_str("WEBVTT\n\n");
    let mut cues = 0usize;
    for line in normalized.trim().lines() {
        if line.contains("-->") && SRT_TIMESTAMP.is_match(line) {
            output.push_str(&convert_timing_line(line));
            cues += 1;
        } else {
            output.push_str(line);
        }
        output.push('\n');
    }

    if cues == 0 {
        return Err(SubtitleError::InvalidFormat {
            reason: "no cue timings found".to_string(),
        });
    }
    Ok((output, SubtitleFormat::Srt))
}

fn convert_timing_line(line: &str) -> String {
    SRT_TIMESTAMP
        .replace_all(line, |captures: &regex::Captures<'_>| {
            format!(
                "{:0>2}:{}:{}.{:0<3}",
                &captures[1], &captures[2], &captures[3], &captures[4]
            )
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRT: &str = "1\r\n00:00:01,000 --> 00:00:04,500\r\nHello there\r\n\r\n2\r\n00:00:05,250 --> 00:00:07,000\r\nGeneral Kenobi\r\n";

    #[test]
    fn test_srt_to_webvtt() {
        let (vtt, format) = to_webvtt(SRT).unwrap();
        assert_eq!(format, SubtitleFormat::Srt);
        assert!(vtt.starts_with("WEBVTT\n\n1\n"));
        assert!(vtt.contains("00:00:01.000 --> 00:00:04.500\nHello there\n"));
        assert!(vtt.contains("00:00:05.250 --> 00:00:07.000\nGeneral Kenobi"));
        assert!(!vtt.contains('\r'));
        assert!(!vtt.contains(','));
    }

    #[test]
    fn test_bom_stripped_and_short_fields_padded() {
        let input = format!("{BOM}1\n0:00:01,5 --> 0:00:02,75\nHi\n");
        let (vtt, _) = to_webvtt(&input).unwrap();
        assert!(vtt.starts_with("WEBVTT"));
        assert!(vtt.contains("00:00:01.500 --> 00:00:02.750"));
    }

    #[test]
    fn test_commas_in_dialogue_untouched() {
        let input = "1\n00:00:01,000 --> 00:00:02,000\nWell, 12:30:00,5 is late\n";
        let (vtt, _) = to_webvtt(input).unwrap();
        assert!(vtt.contains("Well, 12:30:00,5 is late"));
    }

    #[test]
    fn test_webvtt_passthrough() {
        let input = "\u{feff}WEBVTT\r\n\r\n00:01.000 --> 00:02.000\r\nHi\r\n";
        let (vtt, format) = to_webvtt(input).unwrap();
        assert_eq!(format, SubtitleFormat::Vtt);
        assert_eq!(vtt, "WEBVTT\n\n00:01.000 --> 00:02.000\nHi\n");
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            to_webvtt("not a subtitle"),
            Err(SubtitleError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_latin1_fallback() {
        let raw = b"caf\xe9";
        assert_eq!(decode_subtitle_bytes(raw), "café");
    }
}
