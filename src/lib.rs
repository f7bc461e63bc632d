pub mod classify;
pub mod clients;
pub mod config;
pub mod frame;
pub mod images;
pub mod prompt;
pub mod reassembly;
pub mod relay;
pub mod session;
pub mod store;
pub mod tale;
