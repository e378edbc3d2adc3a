//! Custom assertion utilities for tests.

/// Assert that a result is Ok and return the inner value.
///
/// # Panics
///
/// Panics with `context` and the error if the result is `Err`.
#[allow(dead_code)]
pub fn assert_ok<T, E: std::fmt::Debug>(result: Result<T, E>, context: &str) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("{} failed: {:?}", context, e),
    }
}

/// Assert that a result is Err.
#[allow(dead_code)]
pub fn assert_err<T: std::fmt::Debug, E: std::fmt::Debug>(result: Result<T, E>, context: &str) {
    if let Ok(v) = result {
        panic!("{} should have failed but got: {:?}", context, v);
    }
}

/// Assert that an error's display text contains `expected_text`.
#[allow(dead_code)]
pub fn assert_error_contains<E: std::fmt::Display>(error: &E, expected_text: &str, context: &str) {
    let message = error.to_string();
    assert!(
        message.contains(expected_text),
        "{}: expected error containing '{}', got: {}",
        context,
        expected_text,
        message
    );
}
