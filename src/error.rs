use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Broad classification of a failure, used by callers to decide whether to retry a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ErrorKind {
    /// The consensus or execution data source could not be reached.
    UpstreamUnavailable,

    /// One batch of a multi-batch fetch failed, so the entire fetch was discarded.
    PartialFetchFailure,

    /// A queue position or registry index outside the current bounds was requested.
    OutOfRange,

    /// A returned value did not have the expected shape.
    DecodeMismatch,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            Self::UpstreamUnavailable => "upstream unavailable",
            Self::PartialFetchFailure => "partial fetch failure",
            Self::OutOfRange => "out of range",
            Self::DecodeMismatch => "decode mismatch",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Error {
    message: String,
    kind: ErrorKind,
}

impl Error {
    /// Extend an error message with additional context, keeping the same kind.
    pub fn context(self, context: impl Display) -> Self {
        Self {
            message: format!("{context}: {}", self.message),
            kind: self.kind,
        }
    }

    /// The classification of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The consensus or execution client could not serve a request.
    ///
    /// This covers connection failures, RPC error responses, timeouts, and data that the upstream
    /// should have but does not (e.g. no proposed block anywhere in the slot lookback window). Add
    /// specifics with [`context`](Self::context).
    pub fn upstream_unavailable() -> Self {
        Self {
            message: "upstream unavailable".to_string(),
            kind: ErrorKind::UpstreamUnavailable,
        }
    }

    /// A batch within a multi-batch fetch failed.
    ///
    /// The results of every other batch in the same fetch are discarded along with it. A snapshot
    /// with missing entries is never returned.
    pub fn partial_fetch_failure() -> Self {
        Self {
            message: "batched fetch failed".to_string(),
            kind: ErrorKind::PartialFetchFailure,
        }
    }

    /// A position or index outside the bounds of the registry or queue.
    pub fn out_of_range() -> Self {
        Self {
            message: "out of range".to_string(),
            kind: ErrorKind::OutOfRange,
        }
    }

    /// A value returned from a contract or API did not match its expected type.
    ///
    /// This implies a protocol or ABI mismatch, and is never retried.
    pub fn decode_mismatch() -> Self {
        Self {
            message: "decode mismatch".to_string(),
            kind: ErrorKind::DecodeMismatch,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<alloy::transports::TransportError> for Error {
    fn from(err: alloy::transports::TransportError) -> Self {
        Self::upstream_unavailable().context(err)
    }
}

impl From<alloy::contract::Error> for Error {
    fn from(err: alloy::contract::Error) -> Self {
        match err {
            alloy::contract::Error::AbiError(err) => Self::decode_mismatch().context(err),
            err => Self::upstream_unavailable().context(err),
        }
    }
}

impl From<alloy::sol_types::Error> for Error {
    fn from(err: alloy::sol_types::Error) -> Self {
        Self::decode_mismatch().context(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::decode_mismatch().context(err)
        } else {
            Self::upstream_unavailable().context(err)
        }
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Extension functions for converting other result types into [`Result`].
pub trait ResultExt {
    type Ok;

    /// Wrap an error with an error kind, preserving the original error context.
    fn context(self, f: impl FnOnce() -> Error) -> Result<Self::Ok>;
}

impl<T, E> ResultExt for Result<T, E>
where
    E: std::error::Error,
{
    type Ok = T;

    fn context(self, f: impl FnOnce() -> Error) -> Result<<Self as ResultExt>::Ok> {
        self.map_err(|err| f().context(err))
    }
}

macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err);
        }
    };
}
pub(crate) use ensure;

#[cfg(test)]
mod test {
    use super::*;

    #[test_log::test]
    fn test_context_keeps_kind() {
        let err = Error::out_of_range()
            .context("position 7")
            .context("queue lookup");
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        assert_eq!(
            err.to_string(),
            "out of range: queue lookup: position 7: out of range"
        );
    }

    #[test_log::test]
    fn test_result_ext() {
        let res: Result<u64, std::num::ParseIntError> = "nope".parse::<u64>();
        let err = res.context(Error::decode_mismatch).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecodeMismatch);
    }
}
