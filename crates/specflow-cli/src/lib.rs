//! specflow CLI library: the command implementations behind the binary,
//! exposed so integration tests can drive them directly.

pub mod commands;
