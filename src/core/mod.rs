pub mod abi;
pub mod checkpoint;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod handlers;
pub mod history;
pub mod identity;
pub mod ingest;
pub mod keys;
pub mod lifecycle;
pub mod llm;
pub mod model;
pub mod oracle;
pub mod reliability;
pub mod retry;
pub mod terminal;
pub mod timing;
