pub mod error;
pub mod ids;

pub use error::{NetError, Result};
pub use ids::{call_id, connection_id, generate_id, request_id};
