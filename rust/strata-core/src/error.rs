// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use arrow_schema::ArrowError;
use snafu::{location, Location, Snafu};

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Allocates error on the heap and then places `e` into it.
#[inline]
pub fn box_error(e: impl std::error::Error + Send + Sync + 'static) -> BoxedError {
    Box::new(e)
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Invalid user input: {source}, {location}"))]
    InvalidInput {
        source: BoxedError,
        location: Location,
    },
    #[snafu(display("Schema mismatch: {message}, {location}"))]
    SchemaMismatch { message: String, location: Location },
    #[snafu(display("Not found: {uri}, {location}"))]
    NotFound { uri: String, location: Location },
    #[snafu(display("StrataError(IO): {source}, {location}"))]
    IO {
        source: BoxedError,
        location: Location,
    },
    #[snafu(display("Cancelled"))]
    Cancelled { location: Location },
    #[snafu(display("Resource exhausted: {message}, {location}"))]
    ResourceExhausted { message: String, location: Location },
    #[snafu(display("Not supported: {source}, {location}"))]
    NotSupported {
        source: BoxedError,
        location: Location,
    },
    #[snafu(display("Query Execution error: {message}, {location}"))]
    Execution { message: String, location: Location },
    #[snafu(display("StrataError(Arrow): {message}, {location}"))]
    Arrow { message: String, location: Location },
    #[snafu(display("Encountered internal error: {message}, {location}"))]
    Internal { message: String, location: Location },
    #[snafu(display("Wrapped error: {error}, {location}"))]
    Wrapped {
        error: BoxedError,
        location: Location,
    },
    /// A failure while processing one split, tagged with the split's path
    #[snafu(display("Error reading split {path}: {source}"))]
    Split {
        path: String,
        source: Box<Error>,
        location: Location,
    },
}

/// Coarse classification of an [`Error`].
///
/// Drives propagation decisions: user errors abort the split, missing resources
/// may be ignored by configuration, cancellation wins over everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    User,
    MissingResource,
    Io,
    Cancelled,
    ResourceExhausted,
    Internal,
}

impl Error {
    pub fn io(message: impl Into<String>, location: Location) -> Self {
        let message: String = message.into();
        Self::IO {
            source: message.into(),
            location,
        }
    }

    pub fn invalid_input(message: impl Into<String>, location: Location) -> Self {
        let message: String = message.into();
        Self::InvalidInput {
            source: message.into(),
            location,
        }
    }

    pub fn not_supported(message: impl Into<String>, location: Location) -> Self {
        let message: String = message.into();
        Self::NotSupported {
            source: message.into(),
            location,
        }
    }

    pub fn internal(message: impl Into<String>, location: Location) -> Self {
        Self::Internal {
            message: message.into(),
            location,
        }
    }

    pub fn cancelled(location: Location) -> Self {
        Self::Cancelled { location }
    }

    /// Attach the path of the split that was being processed.
    ///
    /// Errors that already carry a path are returned unchanged.
    pub fn in_split(self, path: impl Into<String>) -> Self {
        match self {
            Self::Split { .. } => self,
            other => Self::Split {
                path: path.into(),
                source: Box::new(other),
                location: location!(),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Split { source, .. } => source.kind(),
            Self::Wrapped { error, .. } => match error.downcast_ref::<Self>() {
                Some(inner) => inner.kind(),
                None => ErrorKind::Internal,
            },
            Self::InvalidInput { .. } | Self::SchemaMismatch { .. } | Self::NotSupported { .. } => {
                ErrorKind::User
            }
            Self::NotFound { .. } => ErrorKind::MissingResource,
            Self::IO { .. } => ErrorKind::Io,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::Execution { .. } | Self::Arrow { .. } | Self::Internal { .. } => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// The path of the split this error was raised for, if known
    pub fn split_path(&self) -> Option<&str> {
        match self {
            Self::Split { path, .. } => Some(path),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
pub type ArrowResult<T> = std::result::Result<T, ArrowError>;
#[cfg(feature = "datafusion")]
pub type DataFusionResult<T> = std::result::Result<T, datafusion_common::DataFusionError>;

impl From<ArrowError> for Error {
    #[track_caller]
    fn from(e: ArrowError) -> Self {
        match e {
            ArrowError::ExternalError(err) => match err.downcast::<Self>() {
                Ok(err) => *err,
                Err(err) => Self::Wrapped {
                    error: err,
                    location: location!(),
                },
            },
            ArrowError::IoError(_, err) => Self::IO {
                source: box_error(err),
                location: location!(),
            },
            _ => Self::Arrow {
                message: e.to_string(),
                location: location!(),
            },
        }
    }
}

impl From<std::io::Error> for Error {
    #[track_caller]
    fn from(e: std::io::Error) -> Self {
        Self::IO {
            source: box_error(e),
            location: location!(),
        }
    }
}

impl From<object_store::Error> for Error {
    #[track_caller]
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { path, .. } => Self::NotFound {
                uri: path,
                location: location!(),
            },
            other => Self::IO {
                source: box_error(other),
                location: location!(),
            },
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    #[track_caller]
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            return Self::Cancelled {
                location: location!(),
            };
        }
        Self::Execution {
            message: format!("Tokio join error: {}", e),
            location: location!(),
        }
    }
}

impl From<Error> for ArrowError {
    fn from(value: Error) -> Self {
        Self::ExternalError(Box::new(value))
    }
}

#[cfg(feature = "datafusion")]
impl From<datafusion_common::DataFusionError> for Error {
    #[track_caller]
    fn from(e: datafusion_common::DataFusionError) -> Self {
        match e {
            datafusion_common::DataFusionError::NotImplemented(message) => Self::NotSupported {
                source: message.into(),
                location: location!(),
            },
            datafusion_common::DataFusionError::External(err) => match err.downcast::<Self>() {
                Ok(err) => *err,
                Err(err) => Self::Wrapped {
                    error: err,
                    location: location!(),
                },
            },
            other => Self::Execution {
                message: other.to_string(),
                location: location!(),
            },
        }
    }
}
