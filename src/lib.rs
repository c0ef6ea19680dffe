pub mod app;
pub mod config;
pub mod dailymed;
pub mod domain;
pub mod error;
pub mod feed;
pub mod http;
pub mod ingredients;
pub mod labels;
pub mod normalize;
pub mod output;
pub mod reconcile;
pub mod report;
pub mod retry;
pub mod spl;
pub mod store;
