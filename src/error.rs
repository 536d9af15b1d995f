use thiserror::Error;

/// Error types that can be produced by the onboarding components.
#[derive(Error, Debug)]
pub enum OnboardError {
    /// Network communication related errors.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Errors encountered during discovery shutdown.
    #[error("Discovery shutdown error: {0}")]
    ShutdownError(String),

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// State errors, indicating an invalid operation for the current state.
    #[error("State error: {0}")]
    StateError(String),

    /// A candidate server address failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The active server address could not be committed.
    #[error("Failed to save server address: {0}")]
    StoreError(String),
}

/// Diagnostics produced while validating a candidate server address.
///
/// The display text of each variant is what the onboarding state shows
/// to the user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The input is not an absolute http(s) URI, even with a default scheme.
    #[error("Invalid server address: {0}")]
    MalformedUri(String),

    /// DNS, connect or timeout failure.
    #[error("Server unreachable: {0}")]
    Unreachable(String),

    /// A redirect response carried no usable `Location` header.
    #[error("Server sent an invalid redirect")]
    InvalidRedirect,

    /// The redirect chain was longer than the configured limit.
    #[error("Too many redirects (limit {0})")]
    TooManyRedirects(u32),

    /// A non-redirect, non-200 response.
    #[error("Server returned HTTP status {0}")]
    HttpStatus(u16),

    /// The endpoint answered but does not identify as a Jellyfin server.
    #[error("Not a Jellyfin server")]
    NotAServer,
}

/// Result type for the onboarding components.
pub type Result<T> = std::result::Result<T, OnboardError>;
