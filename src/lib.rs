pub mod analyzer;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod graph;
pub mod releases;
pub mod report;
pub mod run;
pub mod symbols;
pub mod version;
