pub mod constants;
pub mod envelope;
pub mod error;
pub mod protocol;
pub mod types;
pub mod validation;
