pub mod routes;

pub use routes::{AppState, app};
