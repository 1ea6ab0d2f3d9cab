//! HTTP surface: routes, error mapping and the start/stop toggle

pub mod error;
pub mod routes;
pub mod toggle;

pub use error::{ApiError, ApiResult};
pub use routes::{router, AppState, ARCHIVE_NAME};
pub use toggle::ServiceToggle;
