#[macro_use]
extern crate rocket;

pub mod api;
pub mod blobs;
pub mod cache;
pub mod config;
pub mod cors;
pub mod images;
pub mod interceptor;
