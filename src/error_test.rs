use super::*;

#[test]
fn test_error_code() {
    let err: Result<()> = err_at!(RangeBusy, msg: "range {} busy", "t1[..m]");
    let err = err.unwrap_err();
    assert_eq!(err.to_code(), code::RANGESERVER_RANGE_BUSY);
    assert_eq!(code::to_text(err.to_code()), "RANGESERVER_RANGE_BUSY");
    assert!(err.is_retryable());
    assert_eq!(err.to_message(), "range t1[..m] busy");

    let err: Result<()> = err_at!(RangeNotActive, msg: "disabled");
    let err = err.unwrap_err();
    assert_eq!(err.to_code(), code::RANGESERVER_RANGE_NOT_ACTIVE);
    assert!(!err.is_retryable());

    let err: Result<()> = err_at!(InvalidInput, msg: "bad row interval");
    let err = err.unwrap_err();
    assert_eq!(err.to_code(), code::INVALID_ARGUMENT);
    assert_eq!(code::to_text(err.to_code()), "INVALID_ARGUMENT");
    assert!(!err.is_retryable());

    assert_eq!(code::to_text(12345678), "UNKNOWN");
}

#[test]
fn test_error_wrap() {
    let res: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
        std::io::ErrorKind::Other,
        "disk on fire",
    ));
    let err: Result<()> = err_at!(IOError, res, "fragment {}", 10);
    let err = err.unwrap_err();
    assert_eq!(err.to_code(), code::LOCAL_IO_ERROR);
    assert_eq!(err.to_message(), "disk on fire fragment 10");
    assert!(format!("{}", err).contains("IOError"));
}
