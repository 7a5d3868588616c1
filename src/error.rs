use std::{fmt, io, panic::Location};

use thiserror::Error;

/// Status codes shared by the client and the server. Client side codes are
/// negative, server side codes are positive and travel in the message
/// header's result code byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultCode {
    TxnFailed,
    BatchFailed,
    NoResponse,
    MaxErrorRate,
    MaxRetriesExceeded,
    AsyncQueueFull,
    Connection,
    TlsError,
    InvalidNode,
    NoMoreConnections,
    AsyncConnection,
    ClientAbort,
    InvalidHost,
    NoMoreRecords,
    Param,
    Client,
    Ok,
    Server,
    RecordNotFound,
    Generation,
    RequestInvalid,
    RecordExists,
    BinExists,
    ClusterChange,
    ServerFull,
    Timeout,
    AlwaysForbidden,
    Cluster,
    BinIncompatibleType,
    RecordTooBig,
    RecordBusy,
    ScanAborted,
    UnsupportedFeature,
    BinNotFound,
    DeviceOverload,
    RecordKeyMismatch,
    NamespaceNotFound,
    BinName,
    FailForbidden,
    ElementNotFound,
    ElementExists,
    EnterpriseOnly,
    OpNotApplicable,
    FilteredOut,
    LostConflict,
    QueryEnd,
    NotAuthenticated,
    RoleViolation,
    Udf,
    MrtBlocked,
    MrtVersionMismatch,
    MrtExpired,
    MrtTooManyWrites,
    MrtCommitted,
    MrtAborted,
    BatchDisabled,
    QueryAborted,
    Unknown(i32),
}

impl ResultCode {
    pub fn code(&self) -> i32 {
        use ResultCode::*;
        match self {
            TxnFailed => -17,
            BatchFailed => -16,
            NoResponse => -15,
            MaxErrorRate => -14,
            MaxRetriesExceeded => -12,
            AsyncQueueFull => -11,
            Connection => -10,
            TlsError => -9,
            InvalidNode => -8,
            NoMoreConnections => -7,
            AsyncConnection => -6,
            ClientAbort => -5,
            InvalidHost => -4,
            NoMoreRecords => -3,
            Param => -2,
            Client => -1,
            Ok => 0,
            Server => 1,
            RecordNotFound => 2,
            Generation => 3,
            RequestInvalid => 4,
            RecordExists => 5,
            BinExists => 6,
            ClusterChange => 7,
            ServerFull => 8,
            Timeout => 9,
            AlwaysForbidden => 10,
            Cluster => 11,
            BinIncompatibleType => 12,
            RecordTooBig => 13,
            RecordBusy => 14,
            ScanAborted => 15,
            UnsupportedFeature => 16,
            BinNotFound => 17,
            DeviceOverload => 18,
            RecordKeyMismatch => 19,
            NamespaceNotFound => 20,
            BinName => 21,
            FailForbidden => 22,
            ElementNotFound => 23,
            ElementExists => 24,
            EnterpriseOnly => 25,
            OpNotApplicable => 26,
            FilteredOut => 27,
            LostConflict => 28,
            QueryEnd => 50,
            NotAuthenticated => 80,
            RoleViolation => 81,
            Udf => 100,
            MrtBlocked => 120,
            MrtVersionMismatch => 121,
            MrtExpired => 122,
            MrtTooManyWrites => 123,
            MrtCommitted => 124,
            MrtAborted => 125,
            BatchDisabled => 150,
            QueryAborted => 210,
            Unknown(code) => *code,
        }
    }

    /// Maps the result code byte of a server response.
    pub fn from_server(code: u8) -> Self {
        Self::from(code as i32)
    }
}

impl From<i32> for ResultCode {
    fn from(code: i32) -> Self {
        use ResultCode::*;
        match code {
            -17 => TxnFailed,
            -16 => BatchFailed,
            -15 => NoResponse,
            -14 => MaxErrorRate,
            -12 => MaxRetriesExceeded,
            -11 => AsyncQueueFull,
            -10 => Connection,
            -9 => TlsError,
            -8 => InvalidNode,
            -7 => NoMoreConnections,
            -6 => AsyncConnection,
            -5 => ClientAbort,
            -4 => InvalidHost,
            -3 => NoMoreRecords,
            -2 => Param,
            -1 => Client,
            0 => Ok,
            1 => Server,
            2 => RecordNotFound,
            3 => Generation,
            4 => RequestInvalid,
            5 => RecordExists,
            6 => BinExists,
            7 => ClusterChange,
            8 => ServerFull,
            9 => Timeout,
            10 => AlwaysForbidden,
            11 => Cluster,
            12 => BinIncompatibleType,
            13 => RecordTooBig,
            14 => RecordBusy,
            15 => ScanAborted,
            16 => UnsupportedFeature,
            17 => BinNotFound,
            18 => DeviceOverload,
            19 => RecordKeyMismatch,
            20 => NamespaceNotFound,
            21 => BinName,
            22 => FailForbidden,
            23 => ElementNotFound,
            24 => ElementExists,
            25 => EnterpriseOnly,
            26 => OpNotApplicable,
            27 => FilteredOut,
            28 => LostConflict,
            50 => QueryEnd,
            80 => NotAuthenticated,
            81 => RoleViolation,
            100 => Udf,
            120 => MrtBlocked,
            121 => MrtVersionMismatch,
            122 => MrtExpired,
            123 => MrtTooManyWrites,
            124 => MrtCommitted,
            125 => MrtAborted,
            150 => BatchDisabled,
            210 => QueryAborted,
            other => Unknown(other),
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultCode::Unknown(code) => write!(f, "Unknown({})", code),
            other => write!(f, "{:?}({})", other, other.code()),
        }
    }
}

/// An error surfaced across the cluster, connection and transaction layers.
///
/// Every error records the source location that raised it so that a status
/// returned through several layers can still be traced to its origin.
#[derive(Clone, Debug, Error)]
#[error("{code}: {message} [{location}]")]
pub struct Error {
    pub code: ResultCode,
    pub message: String,
    pub in_doubt: bool,
    pub location: &'static Location<'static>,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    #[track_caller]
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            in_doubt: false,
            location: Location::caller(),
        }
    }

    /// Deadline exceeded. Carries no message: this is raised on the hot I/O
    /// path and callers usually retry.
    #[track_caller]
    pub fn timeout() -> Self {
        Self::new(ResultCode::Timeout, String::new())
    }

    #[track_caller]
    pub fn client(message: impl Into<String>) -> Self {
        Self::new(ResultCode::Client, message)
    }

    #[track_caller]
    pub fn param(message: impl Into<String>) -> Self {
        Self::new(ResultCode::Param, message)
    }

    #[track_caller]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ResultCode::Connection, message)
    }

    #[track_caller]
    pub fn cluster_change(message: impl Into<String>) -> Self {
        Self::new(ResultCode::ClusterChange, message)
    }

    pub fn with_in_doubt(mut self, in_doubt: bool) -> Self {
        self.in_doubt = in_doubt;
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.code == ResultCode::Timeout
    }

    /// Errors that may be retried on another connection or node.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            ResultCode::Timeout | ResultCode::Connection | ResultCode::NoMoreConnections
        )
    }
}

impl From<io::Error> for Error {
    #[track_caller]
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::timeout(),
            _ => Self::connection(format!("Socket error: {}", e)),
        }
    }
}

impl From<rustls::Error> for Error {
    #[track_caller]
    fn from(e: rustls::Error) -> Self {
        Self::new(ResultCode::TlsError, e.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    #[track_caller]
    fn from(e: base64::DecodeError) -> Self {
        Self::client(format!("Invalid base64: {}", e))
    }
}

impl From<rmp::encode::ValueWriteError> for Error {
    #[track_caller]
    fn from(e: rmp::encode::ValueWriteError) -> Self {
        Self::client(format!("Failed to pack value: {}", e))
    }
}
