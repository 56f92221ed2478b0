pub mod admin;
pub mod ark;
pub mod config;
pub mod db;
pub mod error;
pub mod grants;
pub mod http;
pub mod identity;
pub mod image_processing;
pub mod ledger;
pub mod pipeline;
pub mod prompt;
pub mod state;
pub mod storage;

#[cfg(test)]
mod test_support;
