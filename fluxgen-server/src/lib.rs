pub mod api;
pub mod config;
pub mod page;
pub mod remote;
pub mod ui;
