use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid resolution '{0}', expected WIDTHxHEIGHT")]
    InvalidResolution(String),
    #[error("Inverted fps bounds: min {min} / target {target} / max {max}")]
    InvertedFpsBounds { min: f64, target: f64, max: f64 },
    #[error("Invalid fps value: {0}")]
    InvalidFps(f64),
    #[error("Invalid setting '{name}': {reason}")]
    InvalidSetting { name: &'static str, reason: String },
    #[error("Failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            name,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("A source named '{0}' is already registered")]
    DuplicateName(String),
    #[error("Source '{0}' needs a backing path")]
    MissingBackingPath(String),
    #[error("Backing resource for '{name}' not found: {}", .path.display())]
    MissingBackingResource { name: String, path: PathBuf },
    #[error("Image sequence '{name}' has no frames in {}", .path.display())]
    EmptyImageSequence { name: String, path: PathBuf },
    #[error("Cannot decode '{}' for source '{name}': {reason}", .path.display())]
    UnsupportedContainer {
        name: String,
        path: PathBuf,
        reason: String,
    },
    #[error("Unknown source '{0}'")]
    UnknownSource(String),
    #[error("Source '{0}' is disabled")]
    SourceDisabled(String),
    #[error("Source '{0}' is active and no other enabled source exists")]
    LastEnabledSource(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, thiserror::Error)]
pub enum SourceReadError {
    #[error("End of stream")]
    EndOfStream,
    #[error("Missing frame: {}", .0.display())]
    MissingFrame(PathBuf),
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<image::ImageError> for SourceReadError {
    fn from(value: image::ImageError) -> Self {
        match value {
            image::ImageError::IoError(e) => Self::Io(e),
            other => Self::Decode(other.to_string()),
        }
    }
}

impl From<gif::DecodingError> for SourceReadError {
    fn from(value: gif::DecodingError) -> Self {
        match value {
            gif::DecodingError::Io(e) => Self::Io(e),
            other => Self::Decode(other.to_string()),
        }
    }
}
