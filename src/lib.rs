pub mod cli;
pub mod engine;
pub mod state;
pub mod storage;
pub mod workflows;
