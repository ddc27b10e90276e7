pub mod executor;
pub mod types;
pub mod validator;

pub use executor::{DryRunReport, ExecutionResult, OperationExecutor, PhaseProgress};
pub use types::{Operation, Phase};
pub use validator::{validate_response, ValidationReport};
