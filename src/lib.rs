pub mod api;
pub mod audit;
pub mod auth;
pub mod config;
pub mod errors;
pub mod files;
pub mod git_api;
pub mod models;
pub mod paths;
pub mod repos;
pub mod search;
pub mod sessions;
pub mod settings;
pub mod tasks;
pub mod term_ws;
pub mod worktrees;

pub use api::{build_router, AppState};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3000;
