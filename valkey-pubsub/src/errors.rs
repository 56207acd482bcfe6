use std::{error, fmt, io};

use arcstr::ArcStr;

/// An enum of all error kinds.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Malformed caller input, detected before any network interaction.
    InvalidArgument,
    /// Transport-level failure surfaced to whichever call was pending.
    Connection,
    /// A route could not be resolved against the current topology.
    Routing,
    /// A blocking operation's deadline elapsed without confirmation.
    Timeout,
    /// The client was used in a mode it was not configured for.
    Configuration,
    /// The server rejected the command; carries the server's own message.
    RemoteCommand,
    /// A response had a shape the caller did not expect.
    UnexpectedReturnType,
    /// An I/O error from the transport layer.
    Io,
}

/// Represents an error raised by the client.
///
/// For the most part you should be using the `Error` trait to interact with
/// this rather than the actual struct.
pub struct Error {
    repr: ErrorRepr,
}

#[derive(Debug)]
enum ErrorRepr {
    WithDescription(ErrorKind, &'static str),
    WithDescriptionAndDetail(ErrorKind, &'static str, ArcStr),
    IoError(io::Error),
}

/// A shorthand result type used all over the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        match (&self.repr, &other.repr) {
            (&ErrorRepr::WithDescription(kind_a, _), &ErrorRepr::WithDescription(kind_b, _)) => {
                kind_a == kind_b
            }
            (
                &ErrorRepr::WithDescriptionAndDetail(kind_a, _, _),
                &ErrorRepr::WithDescriptionAndDetail(kind_b, _, _),
            ) => kind_a == kind_b,
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error {
            repr: ErrorRepr::IoError(err),
        }
    }
}

impl From<(ErrorKind, &'static str)> for Error {
    fn from((kind, desc): (ErrorKind, &'static str)) -> Error {
        Error {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for Error {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> Error {
        Error {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail.into()),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> std::result::Result<(), fmt::Error> {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> std::result::Result<(), fmt::Error> {
        match &self.repr {
            ErrorRepr::WithDescription(kind, desc) => {
                desc.fmt(f)?;
                f.write_str(" - ")?;
                fmt::Debug::fmt(&kind, f)
            }
            ErrorRepr::WithDescriptionAndDetail(kind, desc, detail) => {
                desc.fmt(f)?;
                f.write_str(" - ")?;
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                detail.fmt(f)
            }
            ErrorRepr::IoError(err) => err.fmt(f),
        }
    }
}

impl Error {
    /// Returns the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match &self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => *kind,
            ErrorRepr::IoError(_) => ErrorKind::Io,
        }
    }

    /// Returns the error detail, if one was attached.
    pub fn detail(&self) -> Option<&str> {
        match &self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, detail) => Some(detail.as_str()),
            _ => None,
        }
    }

    /// Returns true if this error was raised before any network interaction.
    pub fn is_client_side(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidArgument | ErrorKind::Configuration
        )
    }

    /// Returns true if the error indicates that the connection is no longer
    /// usable and requests on it should not be retried.
    pub fn is_unrecoverable_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection | ErrorKind::Io)
    }

    /// Wraps a server-reported failure message in a typed error.
    pub fn from_server_message(message: impl Into<String>) -> Error {
        Error::from((
            ErrorKind::RemoteCommand,
            "An error was signalled by the server",
            message.into(),
        ))
    }
}

pub(crate) fn closed_connection_error() -> Error {
    Error::from((ErrorKind::Connection, "Connection closed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_round_trips_through_tuple_conversion() {
        let err = Error::from((ErrorKind::Routing, "no replica for slot"));
        assert_eq!(err.kind(), ErrorKind::Routing);
        assert_eq!(err.detail(), None);

        let err = Error::from((
            ErrorKind::RemoteCommand,
            "An error was signalled by the server",
            "NOPERM no permissions to access a channel".to_string(),
        ));
        assert_eq!(err.kind(), ErrorKind::RemoteCommand);
        assert!(err.detail().unwrap().starts_with("NOPERM"));
    }

    #[test]
    fn client_side_errors_are_flagged() {
        assert!(Error::from((ErrorKind::InvalidArgument, "empty channel list")).is_client_side());
        assert!(!Error::from((ErrorKind::Timeout, "deadline elapsed")).is_client_side());
    }
}
