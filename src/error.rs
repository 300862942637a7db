use std::{error, fmt, result};

/// Short form to compose Error values.
///
/// Here are few possible ways:
///
/// ```ignore
/// use crate::Error;
/// err_at!(ParseError, msg: "bad argument");
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(ParseError, std::io::read(buf));
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(ParseError, std::fs::read(file_path), "read failed");
/// ```
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err($crate::Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err($crate::Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err($crate::Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

/// Type alias for Result return type, used by this package.
pub type Result<T> = result::Result<T, Error>;

/// Error variants that are returned by this package's API.
///
/// Each variant carries a prefix, typically identifying the
/// error location, and a message.
#[derive(Clone, PartialEq)]
pub enum Error {
    Fatal(String, String),
    FailConvert(String, String),
    FailCbor(String, String),
    IOError(String, String),
    IPCFail(String, String),
    ThreadFail(String, String),
    InvalidFile(String, String),
    InvalidInput(String, String),
    DecodeFail(String, String),
    Timeout(String, String),
    Closed(String, String),
    BadKey(String, String),
    // block codecs
    UnsupportedType(String, String),
    BadHeader(String, String),
    BadMagic(String, String),
    Truncated(String, String),
    ChecksumMismatch(String, String),
    DeflateFail(String, String),
    InflateFail(String, String),
    // range server
    TableNotFound(String, String),
    GenerationMismatch(String, String),
    OutOfRange(String, String),
    RangeNotFound(String, String),
    InvalidColumnFamily(String, String),
    InvalidScannerId(String, String),
    RangeBusy(String, String),
    RangeNotActive(String, String),
    ReadOnly(String, String),
    ClockSkew(String, String),
    RevisionOrder(String, String),
    Unavailable(String, String),
    TruncatedCommitLog(String, String),
    CorruptCommitLog(String, String),
    PhantomMapNotFound(String, String),
    PlanGenerationMismatch(String, String),
}

/// Numeric error codes exchanged with clients, the master and logged.
pub mod code {
    pub const OK: i32 = 0;
    pub const PROTOCOL_ERROR: i32 = 1;
    pub const REQUEST_TIMEOUT: i32 = 4;
    pub const LOCAL_IO_ERROR: i32 = 5;
    pub const BAD_KEY: i32 = 9;
    pub const BLOCK_COMPRESSOR_UNSUPPORTED_TYPE: i32 = 13;
    pub const BLOCK_COMPRESSOR_INVALID_ARG: i32 = 14;
    pub const BLOCK_COMPRESSOR_TRUNCATED: i32 = 15;
    pub const BLOCK_COMPRESSOR_BAD_HEADER: i32 = 16;
    pub const BLOCK_COMPRESSOR_BAD_MAGIC: i32 = 17;
    pub const BLOCK_COMPRESSOR_CHECKSUM_MISMATCH: i32 = 18;
    pub const BLOCK_COMPRESSOR_DEFLATE_ERROR: i32 = 19;
    pub const BLOCK_COMPRESSOR_INFLATE_ERROR: i32 = 20;
    pub const TABLE_NOT_FOUND: i32 = 22;
    pub const CLOSED: i32 = 47;
    pub const INVALID_ARGUMENT: i32 = 56;
    pub const FAILED_EXPECTATION: i32 = -2;

    pub const RANGESERVER_GENERATION_MISMATCH: i32 = 0x0001_0001;
    pub const RANGESERVER_OUT_OF_RANGE: i32 = 0x0001_0005;
    pub const RANGESERVER_RANGE_NOT_FOUND: i32 = 0x0001_0006;
    pub const RANGESERVER_INVALID_SCANNER_ID: i32 = 0x0001_0007;
    pub const RANGESERVER_INVALID_COLUMNFAMILY: i32 = 0x0001_000A;
    pub const RANGESERVER_TRUNCATED_COMMIT_LOG: i32 = 0x0001_000B;
    pub const RANGESERVER_CORRUPT_COMMIT_LOG: i32 = 0x0001_000E;
    pub const RANGESERVER_UNAVAILABLE: i32 = 0x0001_000F;
    pub const RANGESERVER_REVISION_ORDER_ERROR: i32 = 0x0001_0010;
    pub const RANGESERVER_CLOCK_SKEW: i32 = 0x0001_0014;
    pub const RANGESERVER_RANGE_BUSY: i32 = 0x0001_0019;
    pub const RANGESERVER_RANGE_NOT_ACTIVE: i32 = 0x0001_001A;
    pub const RANGESERVER_PHANTOM_RANGE_MAP_NOT_FOUND: i32 = 0x0001_001D;
    pub const RANGESERVER_RECOVERY_PLAN_GENERATION_MISMATCH: i32 = 0x0001_001E;
    pub const RANGESERVER_SERVER_IN_READONLY_MODE: i32 = 0x0001_0020;

    /// Return the symbolic name for error `code`.
    pub fn to_text(code: i32) -> &'static str {
        match code {
            OK => "OK",
            PROTOCOL_ERROR => "PROTOCOL_ERROR",
            REQUEST_TIMEOUT => "REQUEST_TIMEOUT",
            LOCAL_IO_ERROR => "LOCAL_IO_ERROR",
            BAD_KEY => "BAD_KEY",
            BLOCK_COMPRESSOR_UNSUPPORTED_TYPE => "BLOCK_COMPRESSOR_UNSUPPORTED_TYPE",
            BLOCK_COMPRESSOR_INVALID_ARG => "BLOCK_COMPRESSOR_INVALID_ARG",
            BLOCK_COMPRESSOR_TRUNCATED => "BLOCK_COMPRESSOR_TRUNCATED",
            BLOCK_COMPRESSOR_BAD_HEADER => "BLOCK_COMPRESSOR_BAD_HEADER",
            BLOCK_COMPRESSOR_BAD_MAGIC => "BLOCK_COMPRESSOR_BAD_MAGIC",
            BLOCK_COMPRESSOR_CHECKSUM_MISMATCH => "BLOCK_COMPRESSOR_CHECKSUM_MISMATCH",
            BLOCK_COMPRESSOR_DEFLATE_ERROR => "BLOCK_COMPRESSOR_DEFLATE_ERROR",
            BLOCK_COMPRESSOR_INFLATE_ERROR => "BLOCK_COMPRESSOR_INFLATE_ERROR",
            TABLE_NOT_FOUND => "TABLE_NOT_FOUND",
            CLOSED => "CLOSED",
            INVALID_ARGUMENT => "INVALID_ARGUMENT",
            FAILED_EXPECTATION => "FAILED_EXPECTATION",
            RANGESERVER_GENERATION_MISMATCH => "RANGESERVER_GENERATION_MISMATCH",
            RANGESERVER_OUT_OF_RANGE => "RANGESERVER_OUT_OF_RANGE",
            RANGESERVER_RANGE_NOT_FOUND => "RANGESERVER_RANGE_NOT_FOUND",
            RANGESERVER_INVALID_SCANNER_ID => "RANGESERVER_INVALID_SCANNER_ID",
            RANGESERVER_INVALID_COLUMNFAMILY => "RANGESERVER_INVALID_COLUMNFAMILY",
            RANGESERVER_TRUNCATED_COMMIT_LOG => "RANGESERVER_TRUNCATED_COMMIT_LOG",
            RANGESERVER_CORRUPT_COMMIT_LOG => "RANGESERVER_CORRUPT_COMMIT_LOG",
            RANGESERVER_UNAVAILABLE => "RANGESERVER_UNAVAILABLE",
            RANGESERVER_REVISION_ORDER_ERROR => "RANGESERVER_REVISION_ORDER_ERROR",
            RANGESERVER_CLOCK_SKEW => "RANGESERVER_CLOCK_SKEW",
            RANGESERVER_RANGE_BUSY => "RANGESERVER_RANGE_BUSY",
            RANGESERVER_RANGE_NOT_ACTIVE => "RANGESERVER_RANGE_NOT_ACTIVE",
            RANGESERVER_PHANTOM_RANGE_MAP_NOT_FOUND => {
                "RANGESERVER_PHANTOM_RANGE_MAP_NOT_FOUND"
            }
            RANGESERVER_RECOVERY_PLAN_GENERATION_MISMATCH => {
                "RANGESERVER_RECOVERY_PLAN_GENERATION_MISMATCH"
            }
            RANGESERVER_SERVER_IN_READONLY_MODE => "RANGESERVER_SERVER_IN_READONLY_MODE",
            _ => "UNKNOWN",
        }
    }
}

impl Error {
    fn to_parts(&self) -> (&'static str, &str, &str) {
        use Error::*;

        match self {
            Fatal(p, m) => ("Fatal", p, m),
            FailConvert(p, m) => ("FailConvert", p, m),
            FailCbor(p, m) => ("FailCbor", p, m),
            IOError(p, m) => ("IOError", p, m),
            IPCFail(p, m) => ("IPCFail", p, m),
            ThreadFail(p, m) => ("ThreadFail", p, m),
            InvalidFile(p, m) => ("InvalidFile", p, m),
            InvalidInput(p, m) => ("InvalidInput", p, m),
            DecodeFail(p, m) => ("DecodeFail", p, m),
            Timeout(p, m) => ("Timeout", p, m),
            Closed(p, m) => ("Closed", p, m),
            BadKey(p, m) => ("BadKey", p, m),
            UnsupportedType(p, m) => ("UnsupportedType", p, m),
            BadHeader(p, m) => ("BadHeader", p, m),
            BadMagic(p, m) => ("BadMagic", p, m),
            Truncated(p, m) => ("Truncated", p, m),
            ChecksumMismatch(p, m) => ("ChecksumMismatch", p, m),
            DeflateFail(p, m) => ("DeflateFail", p, m),
            InflateFail(p, m) => ("InflateFail", p, m),
            TableNotFound(p, m) => ("TableNotFound", p, m),
            GenerationMismatch(p, m) => ("GenerationMismatch", p, m),
            OutOfRange(p, m) => ("OutOfRange", p, m),
            RangeNotFound(p, m) => ("RangeNotFound", p, m),
            InvalidColumnFamily(p, m) => ("InvalidColumnFamily", p, m),
            InvalidScannerId(p, m) => ("InvalidScannerId", p, m),
            RangeBusy(p, m) => ("RangeBusy", p, m),
            RangeNotActive(p, m) => ("RangeNotActive", p, m),
            ReadOnly(p, m) => ("ReadOnly", p, m),
            ClockSkew(p, m) => ("ClockSkew", p, m),
            RevisionOrder(p, m) => ("RevisionOrder", p, m),
            Unavailable(p, m) => ("Unavailable", p, m),
            TruncatedCommitLog(p, m) => ("TruncatedCommitLog", p, m),
            CorruptCommitLog(p, m) => ("CorruptCommitLog", p, m),
            PhantomMapNotFound(p, m) => ("PhantomMapNotFound", p, m),
            PlanGenerationMismatch(p, m) => ("PlanGenerationMismatch", p, m),
        }
    }

    /// Map this error onto the numeric error taxonomy.
    pub fn to_code(&self) -> i32 {
        use Error::*;

        match self {
            Fatal(_, _) | FailConvert(_, _) | FailCbor(_, _) => code::FAILED_EXPECTATION,
            IPCFail(_, _) | ThreadFail(_, _) => code::FAILED_EXPECTATION,
            IOError(_, _) | InvalidFile(_, _) => code::LOCAL_IO_ERROR,
            InvalidInput(_, _) => code::INVALID_ARGUMENT,
            DecodeFail(_, _) => code::PROTOCOL_ERROR,
            Timeout(_, _) => code::REQUEST_TIMEOUT,
            Closed(_, _) => code::CLOSED,
            BadKey(_, _) => code::BAD_KEY,
            UnsupportedType(_, _) => code::BLOCK_COMPRESSOR_UNSUPPORTED_TYPE,
            BadHeader(_, _) => code::BLOCK_COMPRESSOR_BAD_HEADER,
            BadMagic(_, _) => code::BLOCK_COMPRESSOR_BAD_MAGIC,
            Truncated(_, _) => code::BLOCK_COMPRESSOR_TRUNCATED,
            ChecksumMismatch(_, _) => code::BLOCK_COMPRESSOR_CHECKSUM_MISMATCH,
            DeflateFail(_, _) => code::BLOCK_COMPRESSOR_DEFLATE_ERROR,
            InflateFail(_, _) => code::BLOCK_COMPRESSOR_INFLATE_ERROR,
            TableNotFound(_, _) => code::TABLE_NOT_FOUND,
            GenerationMismatch(_, _) => code::RANGESERVER_GENERATION_MISMATCH,
            OutOfRange(_, _) => code::RANGESERVER_OUT_OF_RANGE,
            RangeNotFound(_, _) => code::RANGESERVER_RANGE_NOT_FOUND,
            InvalidColumnFamily(_, _) => code::RANGESERVER_INVALID_COLUMNFAMILY,
            InvalidScannerId(_, _) => code::RANGESERVER_INVALID_SCANNER_ID,
            RangeBusy(_, _) => code::RANGESERVER_RANGE_BUSY,
            RangeNotActive(_, _) => code::RANGESERVER_RANGE_NOT_ACTIVE,
            ReadOnly(_, _) => code::RANGESERVER_SERVER_IN_READONLY_MODE,
            ClockSkew(_, _) => code::RANGESERVER_CLOCK_SKEW,
            RevisionOrder(_, _) => code::RANGESERVER_REVISION_ORDER_ERROR,
            Unavailable(_, _) => code::RANGESERVER_UNAVAILABLE,
            TruncatedCommitLog(_, _) => code::RANGESERVER_TRUNCATED_COMMIT_LOG,
            CorruptCommitLog(_, _) => code::RANGESERVER_CORRUPT_COMMIT_LOG,
            PhantomMapNotFound(_, _) => code::RANGESERVER_PHANTOM_RANGE_MAP_NOT_FOUND,
            PlanGenerationMismatch(_, _) => {
                code::RANGESERVER_RECOVERY_PLAN_GENERATION_MISMATCH
            }
        }
    }

    /// Busy and timeout errors can be retried by the caller, all other
    /// errors are permanent for the request that hit them.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RangeBusy(_, _) | Error::Timeout(_, _))
    }

    /// Return the error message, without the location prefix.
    pub fn to_message(&self) -> String {
        self.to_parts().2.to_string()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        let (name, prefix, msg) = self.to_parts();
        write!(f, "{} {}: {}", prefix, name, msg)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

impl error::Error for Error {}

#[cfg(test)]
#[path = "error_test.rs"]
mod error_test;
