//! Generic error handling utilities
//!
//! Provides unified error handling that can work across different error types
//! while maintaining domain-specific error logging patterns.

/// Trait for errors that can distinguish between user-actionable and system errors
///
/// Generic error handling uses this to decide whether to show the specific
/// message or a generic context line with the detail at debug level.
///
/// When `is_user_actionable()` returns `true`, `user_message()` must return
/// `Some(message)`; otherwise it returns `None`.
pub trait ContextualError: std::error::Error {
    /// Returns true if this error contains a specific, user-actionable message
    /// that should be displayed directly to the operator
    ///
    /// Examples of user-actionable errors:
    /// - Invalid configuration values
    /// - Unknown driver names
    ///
    /// Examples of system errors:
    /// - Backend connection failures
    /// - Timeouts
    fn is_user_actionable(&self) -> bool;

    /// Returns the specific user message if this is a user-actionable error
    fn user_message(&self) -> Option<&str>;
}

/// Log errors with appropriate detail level based on error specificity
///
/// # Examples
/// ```rust,no_run
/// # use relaybus::core::error_handling::log_error_with_context;
/// # use relaybus::broker::BrokerError;
///
/// let err = BrokerError::InvalidConfiguration { message: "port must be 1-65535".into() };
/// log_error_with_context(&err, "Loading broker configuration");
/// // Logs: "FATAL: port must be 1-65535"
/// ```
pub fn log_error_with_context<E: ContextualError + std::fmt::Display + std::fmt::Debug>(
    error: &E,
    operation_context: &str,
) {
    if error.is_user_actionable() {
        if let Some(user_msg) = error.user_message() {
            log::error!("FATAL: {}", user_msg);
        } else {
            log::error!("FATAL: {}", operation_context);
        }
    } else {
        log::error!("FATAL: {}", operation_context);
    }
    log::debug!("DETAIL: {}", error);
    log::debug!("DEBUG_DETAILS: {:?}", error);
}
