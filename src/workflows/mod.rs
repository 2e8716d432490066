//! Workflows bundled with the command-line tool.

pub mod triage;
