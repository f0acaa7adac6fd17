//! Data types for torrent search.

use serde::{Deserialize, Serialize};

/// One release offered by an indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentResult {
    pub name: String,
    pub magnet_link: String,
    pub size: u64,
    pub seeders: u32,
    pub leechers: u32,
    pub quality: VideoQuality,
    pub source: String,
    pub added_date: chrono::DateTime<chrono::Utc>,
}

impl TorrentResult {
    /// Format file size in human-readable format.
    pub fn format_size(&self) -> String {
        const GB: u64 = 1024 * 1024 * 1024;
        const MB: u64 = 1024 * 1024;

        if self.size >= GB {
            format!("{:.1} GB", self.size as f64 / GB as f64)
        } else if self.size >= MB {
            format!("{:.1} MB", self.size as f64 / MB as f64)
        } else {
            format!("{:.1} KB", self.size as f64 / 1024.0)
        }
    }

    /// Ranking score: quality dominates, seeders break ties.
    ///
    /// Seeders are capped so a popular cam rip never outranks a healthy
    /// 1080p release.
    pub fn priority_score(&self) -> u32 {
        self.quality.score() * 10 + self.seeders.min(50)
    }
}

/// Video quality parsed from a release name.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VideoQuality {
    Unknown,
    CamRip,
    TeleSync,
    WebRip,
    WebDl720p,
    WebDl1080p,
    Hdtv720p,
    Hdtv1080p,
    Dvd,
    BluRay720p,
    BluRay1080p,
    BluRay4K,
    Remux,
}

impl VideoQuality {
    /// Parses the quality tags scene release names carry.
    pub fn from_release_name(name: &str) -> Self {
        let name = name.to_uppercase();
        let has = |tag: &str| name.contains(tag);
        let web_dl = has("WEB-DL") || has("WEBDL");

        if has("CAM") && !has("CAMERA") {
            Self::CamRip
        } else if has("TELESYNC") || has(".TS.") || has("HDTS") {
            Self::TeleSync
        } else if has("REMUX") {
            Self::Remux
        } else if has("2160P") || has("4K") {
            Self::BluRay4K
        } else if has("1080P") {
            if web_dl {
                Self::WebDl1080p
            } else if has("HDTV") {
                Self::Hdtv1080p
            } else if has("WEBRIP") {
                Self::WebRip
            } else {
                Self::BluRay1080p
            }
        } else if has("720P") {
            if web_dl {
                Self::WebDl720p
            } else if has("HDTV") {
                Self::Hdtv720p
            } else if has("WEBRIP") {
                Self::WebRip
            } else {
                Self::BluRay720p
            }
        } else if has("WEBRIP") {
            Self::WebRip
        } else if has("DVD") {
            Self::Dvd
        } else {
            Self::Unknown
        }
    }

    /// Calculate quality score for sorting.
    pub fn score(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::CamRip => 1,
            Self::TeleSync => 2,
            Self::WebRip => 3,
            Self::Hdtv720p => 4,
            Self::WebDl720p => 5,
            Self::Dvd => 6,
            Self::BluRay720p => 7,
            Self::Hdtv1080p => 8,
            Self::WebDl1080p => 9,
            Self::BluRay1080p => 10,
            Self::BluRay4K => 11,
            Self::Remux => 12,
        }
    }
}
