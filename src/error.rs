use core::fmt;

/// Errors, which can occur in the HCI layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HciError {
    /// The queue ID is out of range.
    InvalidQueue,
    /// The controller was stopped, or commands are being ignored during teardown.
    NotRunning,
    /// The chip has no free TX pages or IDs left.
    ///
    /// This is only used internally by the scheduler and never returned to producers.
    NoResource,
    /// The transport failed to send, read or write.
    TransportError,
    /// The checksum reported by the chip didn't match the one computed by the host.
    ChecksumMismatch,
    /// A blocking command wasn't acknowledged in time.
    Timeout,
    /// Firmware download failed after all attempts were used up.
    LoadFailed,
    /// Another command currently holds the command channel.
    Busy,
    /// The configuration passed to attach was rejected.
    InvalidConfig,
    /// The firmware image couldn't be opened or read.
    ImageUnavailable,
    /// The command payload doesn't fit into the length field of the command header.
    PayloadTooLarge,
}
impl fmt::Display for HciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InvalidQueue => "invalid queue",
            Self::NotRunning => "controller not running",
            Self::NoResource => "no TX resources available",
            Self::TransportError => "transport error",
            Self::ChecksumMismatch => "firmware checksum mismatch",
            Self::Timeout => "command timed out",
            Self::LoadFailed => "firmware load failed",
            Self::Busy => "command channel busy",
            Self::InvalidConfig => "invalid configuration",
            Self::ImageUnavailable => "firmware image unavailable",
            Self::PayloadTooLarge => "command payload too large",
        })
    }
}

pub type HciResult<T> = Result<T, HciError>;
