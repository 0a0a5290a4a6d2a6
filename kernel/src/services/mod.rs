//! Kernel services: the interactive shell and its job table.

pub mod shell;
