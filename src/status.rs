// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Benjamin Chess
use std::fmt;

/// Operation failure taxonomy. Wire replies carry these as negative
/// errno-style i32 codes; 0 is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// A validator returned a non-zero code; the mutation was not applied.
    Refused(i32),
    /// CAS timestamp mismatch.
    Busy,
    /// A callback or RPC exceeded its wall-clock budget.
    TimedOut,
    /// Malformed path.
    InvalidPath,
    /// Value did not parse as the requested type.
    Range,
    /// Malformed frame or opcode; the connection is closed.
    Proto,
    /// Socket or allocation failure.
    Resource,
}

impl Status {
    pub fn code(&self) -> i32 {
        match self {
            Status::Refused(c) if *c != 0 => *c,
            Status::Refused(_) => -libc::EPERM,
            Status::Busy => -libc::EBUSY,
            Status::TimedOut => -libc::ETIMEDOUT,
            Status::InvalidPath => -libc::EINVAL,
            Status::Range => -libc::ERANGE,
            Status::Proto => -libc::EPROTO,
            Status::Resource => -libc::ENOMEM,
        }
    }

    /// Maps a wire code back onto the taxonomy. Unknown negative codes are
    /// treated as validator refusals carrying that code.
    pub fn from_code(code: i32) -> Result<(), Status> {
        if code == 0 {
            return Ok(());
        }
        Err(match -code {
            c if c == libc::EBUSY => Status::Busy,
            c if c == libc::ETIMEDOUT => Status::TimedOut,
            c if c == libc::EINVAL => Status::InvalidPath,
            c if c == libc::ERANGE => Status::Range,
            c if c == libc::EPROTO => Status::Proto,
            c if c == libc::ENOMEM => Status::Resource,
            _ => Status::Refused(code),
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Refused(c) => write!(f, "refused by validator ({})", c),
            Status::Busy => write!(f, "timestamp mismatch"),
            Status::TimedOut => write!(f, "timed out"),
            Status::InvalidPath => write!(f, "invalid path"),
            Status::Range => write!(f, "value out of range"),
            Status::Proto => write!(f, "protocol error"),
            Status::Resource => write!(f, "resource exhausted"),
        }
    }
}

impl std::error::Error for Status {}

impl From<std::io::Error> for Status {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => Status::TimedOut,
            _ => Status::Resource,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for s in [
            Status::Busy,
            Status::TimedOut,
            Status::InvalidPath,
            Status::Range,
            Status::Proto,
            Status::Resource,
        ] {
            assert_eq!(Status::from_code(s.code()), Err(s));
        }
        assert_eq!(Status::from_code(0), Ok(()));
        // a validator's custom code survives as-is
        assert_eq!(Status::from_code(-7), Err(Status::Refused(-7)));
        assert_eq!(Status::Refused(-7).code(), -7);
        assert_eq!(Status::Refused(0).code(), -libc::EPERM);
    }
}
