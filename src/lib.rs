pub mod app;
pub mod config;
pub mod copy;
pub mod domain;
pub mod enclosure;
pub mod error;
pub mod feed;
pub mod location;
pub mod output;
pub mod persister;
pub mod repository;
pub mod resolver;
pub mod schema;
pub mod store;
pub mod walker;
