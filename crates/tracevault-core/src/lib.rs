pub mod collab;
pub mod collector;
pub mod error;
pub mod model;
pub mod provider;
pub mod storage;
pub mod trace;
