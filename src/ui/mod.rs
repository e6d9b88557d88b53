//! Subcommand implementations for the `snapvault` CLI.

pub mod backup;
pub mod init;
