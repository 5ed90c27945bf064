pub mod api;
pub mod stats;
pub mod types;

pub use api::{router, serve};
pub use types::AppState;
