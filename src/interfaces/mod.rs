pub mod alerts;
pub mod attested;
pub mod chain;
pub mod storage;
