// ABOUTME: Library root for sshot - exposes the SSH client for embedding and tests.
// ABOUTME: The command-line binary is in main.rs.

pub mod error;
pub mod output;
pub mod ssh;
