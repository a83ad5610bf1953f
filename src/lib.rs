pub mod backoff;
pub mod clock;
pub mod commands;
pub mod config;
pub mod connectivity;
pub mod delivery;
pub mod identity;
pub mod link;
pub mod net;
pub mod queue;
pub mod runtime;
pub mod simulate;
pub mod storage;
pub mod types;
