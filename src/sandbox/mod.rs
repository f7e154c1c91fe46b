// src/sandbox/mod.rs
// Sandboxed execution (C5): allow-list validation on the calling side,
// short-lived containers for the actual run

pub mod docker;
pub mod validation;

pub use docker::{DockerSandbox, ExecOutput};
pub use validation::{
    default_allowed_imports, shell_split, validate_command, validate_python_code, ALLOWED_IMPORTS,
};
