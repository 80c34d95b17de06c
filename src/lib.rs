pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod export;
pub mod graph;
pub mod grouper;
pub mod output;
pub mod registry;
pub mod resolver;
pub mod resource;
pub mod row_store;
pub mod sanitize;
pub mod table;
