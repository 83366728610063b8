pub mod cli;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod matching;
pub mod models;
pub mod sync;

pub use db::Database;
pub use error::{Error, Result};
