//! Pipe YAML configuration: parsing, env substitution, validation.

pub mod parser;
pub mod types;
pub mod validator;

pub use parser::{parse_pipe, parse_pipe_str};
pub use types::{PipeConfig, PipeParallelism, QuarantineConfig, RecordFormat};
pub use validator::validate_pipe;
