#![doc = include_str!("../README.md")]
pub mod cancel;
pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod hostrev;
pub mod index;
pub mod io;
pub mod pipelines;
pub mod processing;
pub mod query;
pub mod search;
pub mod sort;
pub mod sources;
