pub mod errors;
pub mod id;

pub use errors::ConfigError;
pub use id::{new_id, new_message_id, SessionId};
