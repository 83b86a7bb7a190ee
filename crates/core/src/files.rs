//! File listing types shared by the listing refresher and the console.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Lower bound of the optimal draft length, in words.
pub const DRAFT_OPTIMAL_MIN_WORDS: u64 = 2000;

/// Upper bound of the optimal draft length, in words.
pub const DRAFT_OPTIMAL_MAX_WORDS: u64 = 2500;

/// Backend folder a file lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    BrandData,
    Brief,
    Draft,
}

impl FileKind {
    /// URL path segment of the backend resource.
    pub fn path_segment(self) -> &'static str {
        match self {
            Self::BrandData => "brand-data",
            Self::Brief => "briefs",
            Self::Draft => "drafts",
        }
    }
}

impl std::str::FromStr for FileKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "brand_data" | "brand-data" => Ok(Self::BrandData),
            "brief" | "briefs" => Ok(Self::Brief),
            "draft" | "drafts" => Ok(Self::Draft),
            other => Err(format!("unknown file kind '{other}'")),
        }
    }
}

/// One entry of a backend listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    /// Seconds since the Unix epoch (may carry a fraction).
    pub created_at: f64,
    /// Word count for briefs and drafts, bytes for brand data.
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub preview: Option<String>,
}

impl FileInfo {
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        let secs = self.created_at.trunc() as i64;
        let nanos = (self.created_at.fract() * 1e9) as u32;
        Utc.timestamp_opt(secs, nanos).single()
    }

    /// Preview text when available, otherwise the filename.
    pub fn display_name(&self) -> &str {
        self.preview.as_deref().unwrap_or(&self.name)
    }
}

/// Draft length classification used on listing cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordCountBand {
    Under,
    Optimal,
    OverLimit,
}

impl WordCountBand {
    pub fn classify(words: u64) -> Self {
        if words > DRAFT_OPTIMAL_MAX_WORDS {
            Self::OverLimit
        } else if words >= DRAFT_OPTIMAL_MIN_WORDS {
            Self::Optimal
        } else {
            Self::Under
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_count_bands() {
        assert_eq!(WordCountBand::classify(1999), WordCountBand::Under);
        assert_eq!(WordCountBand::classify(2000), WordCountBand::Optimal);
        assert_eq!(WordCountBand::classify(2500), WordCountBand::Optimal);
        assert_eq!(WordCountBand::classify(2501), WordCountBand::OverLimit);
    }

    #[test]
    fn created_at_converts_fractional_epoch() {
        let info = FileInfo {
            name: "a.md".into(),
            created_at: 1_700_000_000.5,
            size: None,
            preview: None,
        };
        let ts = info.created_at_utc().unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn kind_parses_both_spellings() {
        assert_eq!("brand-data".parse::<FileKind>().unwrap(), FileKind::BrandData);
        assert_eq!("drafts".parse::<FileKind>().unwrap(), FileKind::Draft);
        assert!("videos".parse::<FileKind>().is_err());
    }
}
