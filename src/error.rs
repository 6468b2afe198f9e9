//! Error handling types and utilities.

use std::time::Duration;

/// A specialized Result type for geocoder operations.
pub type Result<T> = std::result::Result<T, GeocoderError>;

/// Coarse classification of a [`GeocoderError`].
///
/// Configuration errors are fatal to the call before anything is written.
/// Validation errors fail the whole batch they occurred in. I/O errors come
/// from the storage collaborator or the input/output streams unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Validation,
    Io,
}

/// Errors returned by indexing and geocoding calls.
#[derive(Debug, thiserror::Error)]
pub enum GeocoderError {
    #[error("zoom must be less than 15 --- zoom was {0}")]
    ZoomTooHigh(i32),

    #[error("zoom must be greater than 0 --- zoom was {0}")]
    ZoomTooLow(i32),

    #[error("unknown type '{0}'")]
    UnknownType(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("doc has no id")]
    MissingId,

    #[error("\"geometry\" property required on id:{0}")]
    GeometryRequired(u64),

    #[error(
        "Polygons may not have more than 50k vertices. Simplify your polygons, or split the polygon into multiple parts on id:{0}"
    )]
    TooManyVertices(u64),

    #[error("cover for id:{id} spans {tiles} tiles at zoom {zoom}, more than the index allows")]
    CoverTooLarge { id: u64, tiles: u64, zoom: u8 },

    #[error("invalid tile '{0}'")]
    InvalidTile(String),

    #[error("invalid document on line {line}: {source}")]
    InvalidDocument {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid coordinate query '{0}'")]
    InvalidCoordinates(String),

    #[error("verification timed out after {0:?}")]
    VerifyTimeout(Duration),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error("stream error: {0}")]
    Stream(#[from] std::io::Error),
}

impl GeocoderError {
    /// Classify this error into the taxonomy callers branch on.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ZoomTooHigh(_)
            | Self::ZoomTooLow(_)
            | Self::UnknownType(_)
            | Self::InvalidConfig(_)
            | Self::VerifyTimeout(_) => ErrorKind::Configuration,
            Self::MissingId
            | Self::GeometryRequired(_)
            | Self::TooManyVertices(_)
            | Self::CoverTooLarge { .. }
            | Self::InvalidTile(_)
            | Self::InvalidDocument { .. }
            | Self::InvalidCoordinates(_) => ErrorKind::Validation,
            Self::Store(_) | Self::Stream(_) => ErrorKind::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::check;
    use rstest::rstest;

    #[rstest]
    #[case(GeocoderError::ZoomTooHigh(15), "zoom must be less than 15 --- zoom was 15")]
    #[case(GeocoderError::ZoomTooLow(-1), "zoom must be greater than 0 --- zoom was -1")]
    #[case(GeocoderError::MissingId, "doc has no id")]
    #[case(GeocoderError::GeometryRequired(1), "\"geometry\" property required on id:1")]
    fn test_display(#[case] err: GeocoderError, #[case] expected: &str) {
        check!(err.to_string() == expected);
    }

    #[test]
    fn test_kind() {
        check!(GeocoderError::ZoomTooHigh(20).kind() == ErrorKind::Configuration);
        check!(GeocoderError::TooManyVertices(3).kind() == ErrorKind::Validation);
        let io = std::io::Error::other("boom");
        check!(GeocoderError::from(io).kind() == ErrorKind::Io);
    }
}
