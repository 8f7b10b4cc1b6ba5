pub mod buffer;
pub mod config;
pub mod downstream;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod mock;
pub mod orchestrator;
pub mod output;
pub mod parser;
pub mod publish;
pub mod record;
pub mod retry;
pub mod storage;
