//! Container detection and the remux strategy each container needs.

use std::fmt;

use serde::Serialize;

/// Bytes of a file header needed for detection.
pub const DETECTION_BYTES: usize = 1024;

const TS_PACKET: usize = 188;
const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Media container of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    Mp4,
    /// QuickTime `qt  ` brand; the index may trail the media data
    QuickTime,
    WebM,
    Matroska,
    Avi,
    MpegTs,
    Unknown,
}

/// How a container gets to a browser-playable stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemuxStrategy {
    /// Served as-is
    Native,
    /// Remuxed once the whole source is downloaded
    FullSource,
    /// Remuxed while the source is fed in order
    Progressive,
}

impl ContainerFormat {
    pub fn strategy(self) -> RemuxStrategy {
        match self {
            Self::Mp4 | Self::WebM => RemuxStrategy::Native,
            Self::MpegTs => RemuxStrategy::Progressive,
            Self::QuickTime | Self::Matroska | Self::Avi | Self::Unknown => {
                RemuxStrategy::FullSource
            }
        }
    }

    pub fn requires_remux(self) -> bool {
        self.strategy() != RemuxStrategy::Native
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Mp4 => "video/mp4",
            Self::QuickTime => "video/quicktime",
            Self::WebM => "video/webm",
            Self::Matroska => "video/x-matroska",
            Self::Avi => "video/x-msvideo",
            Self::MpegTs => "video/mp2t",
            Self::Unknown => "application/octet-stream",
        }
    }

    /// Best guess from a file name when the header is not downloaded yet.
    pub fn from_file_name(name: &str) -> Self {
        let extension = name
            .rsplit_once('.')
            .map(|(_, extension)| extension.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "mp4" | "m4v" => Self::Mp4,
            "mov" => Self::QuickTime,
            "webm" => Self::WebM,
            "mkv" => Self::Matroska,
            "avi" => Self::Avi,
            "ts" | "m2ts" => Self::MpegTs,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mp4 => "MP4",
            Self::QuickTime => "QuickTime",
            Self::WebM => "WebM",
            Self::Matroska => "Matroska",
            Self::Avi => "AVI",
            Self::MpegTs => "MPEG-TS",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Identifies a container from its leading bytes.
pub fn detect_container_format(header: &[u8]) -> ContainerFormat {
    if header.len() >= 12 && &header[4..8] == b"ftyp" {
        return if &header[8..12] == b"qt  " {
            ContainerFormat::QuickTime
        } else {
            ContainerFormat::Mp4
        };
    }

    if header.starts_with(&EBML_MAGIC) {
        // DocType lives in the EBML header; scan a bounded prefix for it.
        let prefix = &header[..header.len().min(64)];
        if prefix.windows(4).any(|window| window == b"webm") {
            return ContainerFormat::WebM;
        }
        return ContainerFormat::Matroska;
    }

    if header.len() >= 12 && header.starts_with(b"RIFF") && &header[8..12] == b"AVI " {
        return ContainerFormat::Avi;
    }

    let sync_bytes = [0, TS_PACKET, 2 * TS_PACKET];
    if header.len() > 2 * TS_PACKET && sync_bytes.iter().all(|at| header[*at] == 0x47) {
        return ContainerFormat::MpegTs;
    }

    ContainerFormat::Unknown
}
