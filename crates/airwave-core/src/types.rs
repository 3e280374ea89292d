//! Core domain types for Airwave.

pub mod common;
pub mod platform;
pub mod quality;
pub mod track;

pub use common::{CrossfadeMode, Volume};
pub use platform::{NetworkClass, PlatformCapabilities};
pub use quality::QualityTier;
pub use track::{ResolvedSource, SourceDescriptor, SourceHint, SourceVariant, Track, TrackMetadata};
