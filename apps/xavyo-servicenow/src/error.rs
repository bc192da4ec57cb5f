//! CLI error types and exit codes

use thiserror::Error;
use xavyo_connector_servicenow::ServiceNowError;

/// Exit codes for the CLI
/// - 0: Success
/// - 1: General error
/// - 2: Configuration error
/// - 3: Network error
/// - 4: Validation error
/// - 5: Server error
pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error(transparent)]
    ServiceNow(#[from] ServiceNowError),

    #[error("Output error: {0}")]
    Output(#[from] serde_json::Error),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) => 2,
            CliError::Validation(_) => 4,
            CliError::ServiceNow(e) => match e {
                ServiceNowError::Config(_) => 2,
                ServiceNowError::Http(_) => 3,
                e if e.is_precondition() => 4,
                e if e.http_status().is_some_and(|s| s >= 500) => 5,
                _ => 1,
            },
            CliError::Output(_) => 1,
        }
    }

    pub fn print(&self) {
        eprintln!("Error: {self}");
        if let CliError::ServiceNow(e) = self {
            if e.is_transient() {
                eprintln!("The failure looks transient; the same command can be retried.");
            }
        }
    }
}
