use std::fmt;

/// Result alias used by every fallible operation in this crate.
pub type WlResult<T> = Result<T, WlError>;

/// Error taxonomy surfaced by the engine, the monitor and the simulator.
///
/// Block-device errors propagate unchanged inside `Io`; everything else is
/// a condition detected by this crate.
#[derive(Debug)]
pub enum WlError {
    /// a geometry invariant of the configuration record is violated
    InvalidConfig,
    /// the config or state record does not match its stored CRC
    InvalidCrc,
    /// operation before `init`, an ambiguous recovery log, or an
    /// irrecoverable erase-count log
    InvalidState,
    /// the partition reports the transparent-encryption capability; its
    /// config sector cannot be interpreted
    Encrypted,
    /// no candidate partition carries a CRC-valid config record
    NotFound,
    /// the partition needs more sector-index bits than the Feistel network
    /// supports
    NotSupported,
    /// a working buffer could not be allocated
    OutOfMemory,
    /// error reported by the underlying block device
    Io(std::io::Error),
    /// simulator only: a physical sector reached its erase endurance
    ExhaustedSector(u64),
}

impl WlError {
    /// Stable short name, used verbatim in the monitor's error document.
    pub fn name(&self) -> &'static str {
        match self {
            WlError::InvalidConfig => "InvalidConfig",
            WlError::InvalidCrc => "InvalidCrc",
            WlError::InvalidState => "InvalidState",
            WlError::Encrypted => "Encrypted",
            WlError::NotFound => "NotFound",
            WlError::NotSupported => "NotSupported",
            WlError::OutOfMemory => "OutOfMemory",
            WlError::Io(_) => "Io",
            WlError::ExhaustedSector(_) => "ExhaustedSector",
        }
    }
}

impl fmt::Display for WlError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WlError::InvalidConfig => write!(f, "config violates a geometry invariant"),
            WlError::InvalidCrc => write!(f, "stored CRC mismatch"),
            WlError::InvalidState => write!(f, "wear-levelling state is invalid or ambiguous"),
            WlError::Encrypted => write!(f, "partition is encrypted"),
            WlError::NotFound => write!(f, "no wear-levelled partition found"),
            WlError::NotSupported => write!(f, "partition exceeds the supported sector-index width"),
            WlError::OutOfMemory => write!(f, "buffer allocation failed"),
            WlError::Io(e) => write!(f, "block device error: {}", e),
            WlError::ExhaustedSector(s) => write!(f, "sector {} reached its erase endurance", s),
        }
    }
}

impl std::error::Error for WlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WlError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WlError {
    fn from(e: std::io::Error) -> Self { WlError::Io(e) }
}

/// Which variant of the translation layer a partition runs.
///
/// `Undefined` is only ever reported by the monitor, when a partition shows
/// no evidence either way (virgin state, no position-update records).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WlMode {
    Undefined,
    Base,
    Advanced,
}

impl WlMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WlMode::Undefined => "undefined",
            WlMode::Base => "base",
            WlMode::Advanced => "advanced",
        }
    }
}

/// Capability consumed from the underlying flash partition.
///
/// Addresses are byte offsets into the partition; `erase_sector` takes a
/// sector index. Reads go through `&self` so that a holder of a shared
/// borrow (the monitor) can never modify the partition. The engine borrows
/// an exclusive handle for its lifetime; it does not guard against anyone
/// else accessing the device concurrently.
pub trait FlashAccess {
    fn read(&self, addr: u64, dst: &mut [u8]) -> WlResult<()>;
    fn write(&mut self, addr: u64, src: &[u8]) -> WlResult<()>;
    fn erase_sector(&mut self, sector: u64) -> WlResult<()>;
    fn erase_range(&mut self, addr: u64, len: u64) -> WlResult<()>;
    /// Total addressable bytes.
    fn len(&self) -> u64;
    /// True when the device transparently encrypts its contents. The config
    /// sector of such a partition cannot be interpreted from an image.
    fn is_encrypted(&self) -> bool { false }
}
