// Error types for the session, the sampler, and the monitor built on them.
//
// Every error is fatal to the measurement it occurs in.  Nothing here retries or degrades; the
// caller decides whether a failed measurement should also end the process, and `exit_code()` gives
// the status to use if it does.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

// Failures reported by the telemetry backend.  The numeric codes are NVML's nvmlReturn_t values and
// the messages are the text of nvmlErrorString(), so that output matches the vendor tools.

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendError {
    #[error("Uninitialized")]
    Uninitialized,
    #[error("Invalid Argument")]
    InvalidArgument,
    #[error("Not Supported")]
    NotSupported,
    #[error("Insufficient Permissions")]
    NoPermission,
    #[error("Already Initialized")]
    AlreadyInitialized,
    #[error("Not Found")]
    NotFound,
    #[error("Insufficient Size")]
    InsufficientSize,
    #[error("Insufficient External Power")]
    InsufficientPower,
    #[error("Driver Not Loaded")]
    DriverNotLoaded,
    #[error("Timeout")]
    Timeout,
    #[error("Interrupt request issue")]
    IrqIssue,
    #[error("NVML Shared Library Not Found")]
    LibraryNotFound,
    #[error("Function Not Found")]
    FunctionNotFound,
    #[error("Corrupted infoROM")]
    CorruptedInfoRom,
    #[error("GPU is lost")]
    GpuLost,
    #[error("GPU requires restart")]
    ResetRequired,
    #[error("The operating system has blocked the request.")]
    OperatingSystem,
    #[error("RM has detected an NVML/RM version mismatch.")]
    VersionMismatch,
    #[error("In use by another client")]
    InUse,
    #[error("Insufficient Memory")]
    InsufficientMemory,
    #[error("No data")]
    NoData,
    #[error("Insufficient resources")]
    InsufficientResources,
    #[error("Unknown Error")]
    Unknown,
}

impl BackendError {
    pub fn code(self) -> i32 {
        match self {
            BackendError::Uninitialized => 1,
            BackendError::InvalidArgument => 2,
            BackendError::NotSupported => 3,
            BackendError::NoPermission => 4,
            BackendError::AlreadyInitialized => 5,
            BackendError::NotFound => 6,
            BackendError::InsufficientSize => 7,
            BackendError::InsufficientPower => 8,
            BackendError::DriverNotLoaded => 9,
            BackendError::Timeout => 10,
            BackendError::IrqIssue => 11,
            BackendError::LibraryNotFound => 12,
            BackendError::FunctionNotFound => 13,
            BackendError::CorruptedInfoRom => 14,
            BackendError::GpuLost => 15,
            BackendError::ResetRequired => 16,
            BackendError::OperatingSystem => 17,
            BackendError::VersionMismatch => 18,
            BackendError::InUse => 19,
            BackendError::InsufficientMemory => 20,
            BackendError::NoData => 21,
            BackendError::InsufficientResources => 23,
            BackendError::Unknown => 999,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Backend(#[from] BackendError),

    #[error("Invalid sampler configuration: {0}")]
    Config(String),

    #[error("Sampler thread: {0}")]
    Thread(String),

    #[error("Output file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    // Backend failures exit with the backend's own code, everything else with 1.  Note the OS only
    // keeps the low eight bits of the status.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Backend(e) => e.code(),
            _ => 1,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Error {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[test]
pub fn test_backend_codes() {
    assert!(BackendError::Uninitialized.code() == 1);
    assert!(BackendError::NotFound.code() == 6);
    assert!(BackendError::Unknown.code() == 999);
    assert!(BackendError::NoPermission.to_string() == "Insufficient Permissions");
}

#[test]
pub fn test_exit_codes() {
    assert!(Error::from(BackendError::DriverNotLoaded).exit_code() == 9);
    assert!(Error::Config("x".to_string()).exit_code() == 1);
    assert!(Error::Thread("x".to_string()).exit_code() == 1);
    let e = Error::io("/tmp/x", io::Error::new(io::ErrorKind::NotFound, "gone"));
    assert!(e.exit_code() == 1);
    assert!(e.to_string() == "Output file /tmp/x: gone");
}
