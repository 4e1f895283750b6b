pub mod analytics;
pub mod api;
pub mod auth;
pub mod config;
pub mod fanout;
pub mod fingerprint;
pub mod models;
pub mod redirect;
pub mod storage;
