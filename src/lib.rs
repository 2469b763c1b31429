pub mod api;
pub mod auth;
pub mod broker;
pub mod calculator;
pub mod config;
pub mod connection;
pub mod db;
pub mod engine;
pub mod entities;
pub mod error;
pub mod external;
pub mod logging;
pub mod server;
