//! Track type representing a single playable item.

use serde::{Deserialize, Serialize};
use url::Url;

use super::QualityTier;

/// How a source is delivered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceVariant {
    /// Segmented adaptive manifest played through the adaptive-streaming client.
    Adaptive,
    /// A single progressive file.
    Direct,
}

/// Caller preference for which variant to try first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceHint {
    /// Adaptive when the platform and resolver both support it, then direct.
    #[default]
    Auto,
    /// Only try the adaptive variant.
    Adaptive,
    /// Only try the direct variant.
    Direct,
}

/// A playable location for a track.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub variant: SourceVariant,
    pub url: Url,
}

impl SourceDescriptor {
    pub const fn new(variant: SourceVariant, url: Url) -> Self {
        Self { variant, url }
    }

    pub const fn adaptive(url: Url) -> Self {
        Self::new(SourceVariant::Adaptive, url)
    }

    pub const fn direct(url: Url) -> Self {
        Self::new(SourceVariant::Direct, url)
    }

    pub const fn is_adaptive(&self) -> bool {
        matches!(self.variant, SourceVariant::Adaptive)
    }
}

/// Display metadata carried alongside a track. Never interpreted by the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
}

/// A single track. Immutable once handed to a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Track {
    /// Catalog identifier, passed to the source resolver.
    pub id: String,
    /// Candidate sources, tried in order. Empty means "ask the resolver".
    pub sources: Vec<SourceDescriptor>,
    /// Declared duration in seconds, if the catalog knows it.
    pub duration: Option<f64>,
    /// Nominal encoded bitrate, used for buffer byte estimates.
    pub bitrate_kbps: Option<u32>,
    /// Highest quality tier the catalog offers for this track.
    pub max_quality: Option<QualityTier>,
    pub metadata: TrackMetadata,
}

impl Track {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sources: Vec::new(),
            duration: None,
            bitrate_kbps: None,
            max_quality: None,
            metadata: TrackMetadata::default(),
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: SourceDescriptor) -> Self {
        self.sources.push(source);
        self
    }

    #[must_use]
    pub const fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
        self
    }

    #[must_use]
    pub const fn with_bitrate(mut self, kbps: u32) -> Self {
        self.bitrate_kbps = Some(kbps);
        self
    }

    #[must_use]
    pub const fn with_max_quality(mut self, tier: QualityTier) -> Self {
        self.max_quality = Some(tier);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: TrackMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Display name for logs.
    pub fn display_name(&self) -> &str {
        self.metadata.title.as_deref().unwrap_or(&self.id)
    }

    /// Whether the caller supplied explicit sources.
    pub fn has_explicit_sources(&self) -> bool {
        !self.sources.is_empty()
    }
}

/// A source produced by the resolver, ready to hand to the media backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedSource {
    pub variant: SourceVariant,
    pub url: Url,
}

impl From<SourceDescriptor> for ResolvedSource {
    fn from(descriptor: SourceDescriptor) -> Self {
        Self {
            variant: descriptor.variant,
            url: descriptor.url,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_track_creation() {
        let track = Track::new("abc123")
            .with_duration(180.0)
            .with_source(SourceDescriptor::direct(
                Url::parse("https://cdn.example.com/abc123.mp3").unwrap(),
            ));
        assert_eq!(track.id, "abc123");
        assert_eq!(track.duration, Some(180.0));
        assert!(track.has_explicit_sources());
        assert_eq!(track.display_name(), "abc123");
    }

    #[test]
    fn test_display_name_prefers_title() {
        let track = Track::new("id").with_metadata(TrackMetadata {
            title: Some("Night Drive".into()),
            artist: None,
        });
        assert_eq!(track.display_name(), "Night Drive");
    }

    #[test]
    fn test_hint_serde() {
        let hint: SourceHint = serde_json::from_str("\"adaptive\"").unwrap();
        assert_eq!(hint, SourceHint::Adaptive);
    }
}
