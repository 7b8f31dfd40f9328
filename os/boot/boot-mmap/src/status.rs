use core::fmt;

/// High bit of a UEFI status word; set for every error code.
const ERROR_BIT: usize = 1 << (usize::BITS - 1);

/// Firmware call result, as far as the handoff needs to tell them apart.
///
/// Only the codes that drive a decision get their own variant; everything else
/// is carried verbatim in [`FirmwareStatus::Other`] for logging.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub enum FirmwareStatus {
    Success,
    /// The map key handed to `ExitBootServices` is stale.
    InvalidParameter,
    Unsupported,
    /// The caller's buffer cannot hold the result; required size was reported.
    BufferTooSmall,
    OutOfResources,
    NotFound,
    Other(usize),
}

impl FirmwareStatus {
    const INVALID_PARAMETER: usize = ERROR_BIT | 2;
    const UNSUPPORTED: usize = ERROR_BIT | 3;
    const BUFFER_TOO_SMALL: usize = ERROR_BIT | 5;
    const OUT_OF_RESOURCES: usize = ERROR_BIT | 9;
    const NOT_FOUND: usize = ERROR_BIT | 14;

    #[must_use]
    pub const fn from_raw(raw: usize) -> Self {
        match raw {
            0 => Self::Success,
            Self::INVALID_PARAMETER => Self::InvalidParameter,
            Self::UNSUPPORTED => Self::Unsupported,
            Self::BUFFER_TOO_SMALL => Self::BufferTooSmall,
            Self::OUT_OF_RESOURCES => Self::OutOfResources,
            Self::NOT_FOUND => Self::NotFound,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub const fn to_raw(self) -> usize {
        match self {
            Self::Success => 0,
            Self::InvalidParameter => Self::INVALID_PARAMETER,
            Self::Unsupported => Self::UNSUPPORTED,
            Self::BufferTooSmall => Self::BUFFER_TOO_SMALL,
            Self::OutOfResources => Self::OUT_OF_RESOURCES,
            Self::NotFound => Self::NOT_FOUND,
            Self::Other(raw) => raw,
        }
    }

    #[must_use]
    pub const fn is_error(self) -> bool {
        self.to_raw() & ERROR_BIT != 0
    }
}

impl fmt::Debug for FirmwareStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("SUCCESS"),
            Self::InvalidParameter => f.write_str("INVALID_PARAMETER"),
            Self::Unsupported => f.write_str("UNSUPPORTED"),
            Self::BufferTooSmall => f.write_str("BUFFER_TOO_SMALL"),
            Self::OutOfResources => f.write_str("OUT_OF_RESOURCES"),
            Self::NotFound => f.write_str("NOT_FOUND"),
            Self::Other(raw) => write!(f, "STATUS({raw:#x})"),
        }
    }
}

impl fmt::Display for FirmwareStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_roundtrip_through_raw() {
        for status in [
            FirmwareStatus::Success,
            FirmwareStatus::InvalidParameter,
            FirmwareStatus::BufferTooSmall,
            FirmwareStatus::OutOfResources,
        ] {
            assert_eq!(FirmwareStatus::from_raw(status.to_raw()), status);
        }
        assert_eq!(
            FirmwareStatus::from_raw(0x8000_0000_0000_0005),
            FirmwareStatus::BufferTooSmall
        );
    }

    #[test]
    fn warnings_are_not_errors() {
        assert!(!FirmwareStatus::from_raw(1).is_error());
        assert!(FirmwareStatus::from_raw(ERROR_BIT | 21).is_error());
    }
}
