// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

use crate::codec::h264::nalu_reader::ReadBitsError;

/// Broad classification of a [`ParseError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The bitstream violates the H.264 grammar or one of its value ranges.
    Structural,
    /// The bitstream is valid but uses a feature this parser does not handle.
    Unsupported,
    /// Memory for the decoder state could not be obtained.
    Resource,
    /// The per-slice callback supplied by the caller failed.
    Callback,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("bitstream error: {0}")]
    Bitstream(#[from] ReadBitsError),
    #[error("broken stream: {0}")]
    Structural(String),
    #[error("unsupported feature: {0}")]
    Unsupported(String),
    #[error("resource error: {0}")]
    Resource(String),
    #[error("slice callback failed: {0:#}")]
    Callback(#[from] anyhow::Error),
}

impl ParseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ParseError::Bitstream(_) | ParseError::Structural(_) => ErrorKind::Structural,
            ParseError::Unsupported(_) => ErrorKind::Unsupported,
            ParseError::Resource(_) => ErrorKind::Resource,
            ParseError::Callback(_) => ErrorKind::Callback,
        }
    }

    /// Whether the caller may keep feeding the same decoder after this error.
    ///
    /// Only resource errors leave the decoder in a state that cannot be
    /// trusted; everything else only invalidates the NAL being parsed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Resource)
    }
}

pub type ParseResult<T> = std::result::Result<T, ParseError>;

/// Returns early with a [`ParseError::Structural`] built from a format string.
macro_rules! structural {
    ($($arg:tt)*) => {
        return Err($crate::codec::h264::error::ParseError::Structural(format!($($arg)*)))
    };
}

/// Returns early with a [`ParseError::Unsupported`] built from a format string.
macro_rules! unsupported {
    ($($arg:tt)*) => {
        return Err($crate::codec::h264::error::ParseError::Unsupported(format!($($arg)*)))
    };
}

pub(crate) use structural;
pub(crate) use unsupported;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::nalu_reader::GetByteError;

    fn fails_structural() -> ParseResult<()> {
        structural!("bad value {}", 3)
    }

    fn fails_unsupported() -> ParseResult<()> {
        unsupported!("slice groups")
    }

    #[test]
    fn error_kinds() {
        let err = fails_structural().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Structural);
        assert_eq!(err.to_string(), "broken stream: bad value 3");
        assert!(err.is_recoverable());

        let err = fails_unsupported().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert!(err.is_recoverable());

        let err = ParseError::from(ReadBitsError::GetByte(GetByteError::OutOfBits));
        assert_eq!(err.kind(), ErrorKind::Structural);

        let err = ParseError::Resource(String::from("oom"));
        assert!(!err.is_recoverable());

        let err = ParseError::from(anyhow::anyhow!("backend busy"));
        assert_eq!(err.kind(), ErrorKind::Callback);
    }
}
