pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod money;
pub mod providers;
pub mod repos;
pub mod routes;
pub mod services;
pub mod webhooks;

pub use app::{AppState, ServiceSettings};
pub use error::{ErrorResponse, ServiceError};
