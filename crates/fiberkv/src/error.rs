// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// fiberkv client error type.
#[derive(Debug)]
pub enum Error {
    ClientClosed,
    InvalidArgument(String),
    InvalidResponse(String),
    Server(ServerError),
    Io(std::io::Error),
    Timeout,
    Cancelled,
}

/// Error reply sent by the server, split into its leading code word and detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: String,
    pub detail: String,
}

impl ServerError {
    /// Parses a raw `-CODE detail` line (without the leading `-`).
    pub fn parse(line: &str) -> Self {
        match line.split_once(' ') {
            Some((code, detail)) if is_code_word(code) => Self {
                code: code.to_string(),
                detail: detail.to_string(),
            },
            None if is_code_word(line) => Self {
                code: line.to_string(),
                detail: String::new(),
            },
            _ => Self {
                code: "ERR".to_string(),
                detail: line.to_string(),
            },
        }
    }
}

fn is_code_word(word: &str) -> bool {
    !word.is_empty() && word.bytes().all(|b| b.is_ascii_uppercase() || b == b'_')
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} {}", self.code, self.detail)
        }
    }
}

impl std::error::Error for ServerError {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ClientClosed => write!(f, "fiberkv: client closed"),
            Error::InvalidArgument(msg) => write!(f, "fiberkv: invalid argument: {msg}"),
            Error::InvalidResponse(msg) => write!(f, "fiberkv: invalid response: {msg}"),
            Error::Server(err) => write!(f, "fiberkv server error: {err}"),
            Error::Io(err) => write!(f, "fiberkv io: {err}"),
            Error::Timeout => write!(f, "fiberkv: deadline exceeded"),
            Error::Cancelled => write!(f, "fiberkv: request cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Server(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Checks whether an error is a server error with the specified code.
pub fn is_server_error(err: &Error, code: &str) -> bool {
    matches!(err, Error::Server(ServerError { code: c, .. }) if c == code)
}

impl Error {
    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Error::InvalidResponse(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn server(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Server(ServerError {
            code: code.into(),
            detail: detail.into(),
        })
    }

    /// True for errors the server reported about the data itself (wrong type,
    /// non-integer value, overflow). These are never transport failures.
    pub fn is_data_error(&self) -> bool {
        matches!(self, Error::Server(_))
    }

    /// True for failures of the connection rather than of the command.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::InvalidResponse(_) | Error::ClientClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_splits_code_word() {
        let err = ServerError::parse("WRONGTYPE Operation against a key holding the wrong kind of value");
        assert_eq!(err.code, "WRONGTYPE");
        assert!(err.detail.starts_with("Operation against"));

        let err = ServerError::parse("value is not an integer");
        assert_eq!(err.code, "ERR");
        assert_eq!(err.detail, "value is not an integer");
    }

    #[test]
    fn data_errors_are_not_connection_errors() {
        let err = Error::server("ERR", "value is not an integer or out of range");
        assert!(err.is_data_error());
        assert!(!err.is_connection_error());
        assert!(is_server_error(&err, "ERR"));
        assert!(!is_server_error(&err, "WRONGTYPE"));
    }
}
