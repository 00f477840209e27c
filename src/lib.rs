// Library exports for umuw
// The binary and the integration tests both build on these modules

pub mod admin;
pub mod auth;
pub mod backend;
pub mod cli;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod local;
pub mod remote;
pub mod render;
pub mod routes;
pub mod state;
pub mod storage;
pub mod sync;
