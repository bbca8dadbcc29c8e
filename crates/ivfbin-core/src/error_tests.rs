//! Tests for `error` module

use super::error::*;

// -------------------------------------------------------------------------
// Error code tests
// -------------------------------------------------------------------------

fn all_errors() -> Vec<Error> {
    vec![
        Error::DimensionMismatch {
            expected: 256,
            actual: 128,
        },
        Error::NotTrained,
        Error::InvalidArgument("k must be positive".into()),
        Error::NotFound(7),
        Error::DeviceOutOfMemory {
            requested: 1024,
            available: 16,
        },
        Error::DeviceExecution("stream closed".into()),
        Error::Config("bad value".into()),
    ]
}

#[test]
fn test_error_codes_are_unique() {
    // Arrange
    let errors = all_errors();

    // Act
    let codes: Vec<&str> = errors.iter().map(Error::code).collect();

    // Assert
    let mut unique_codes = codes.clone();
    unique_codes.sort_unstable();
    unique_codes.dedup();
    assert_eq!(codes.len(), unique_codes.len(), "Error codes must be unique");

    for code in &codes {
        assert!(
            code.starts_with("IVFBIN-"),
            "Code {code} should start with IVFBIN-"
        );
    }
}

#[test]
fn test_error_display_includes_code() {
    for err in all_errors() {
        let display = format!("{err}");
        assert!(
            display.contains(err.code()),
            "'{display}' should contain {}",
            err.code()
        );
    }
}

#[test]
fn test_dimension_mismatch_display() {
    let err = Error::DimensionMismatch {
        expected: 64,
        actual: 72,
    };

    let display = format!("{err}");

    assert!(display.contains("64"));
    assert!(display.contains("72"));
}

#[test]
fn test_caller_errors_are_not_retryable() {
    for err in all_errors() {
        if err.is_caller_error() {
            assert!(!err.is_retryable(), "{err} must not be retried");
        }
    }
}

#[test]
fn test_only_oom_is_retryable() {
    let retryable: Vec<&str> = all_errors()
        .iter()
        .filter(|e| e.is_retryable())
        .map(Error::code)
        .collect();

    assert_eq!(retryable, vec!["IVFBIN-005"]);
}

#[test]
fn test_config_error_converts() {
    let err: Error = crate::config::ConfigError::ParseError("oops".into()).into();

    assert_eq!(err.code(), "IVFBIN-007");
    assert!(format!("{err}").contains("oops"));
}
