pub mod aliases;
pub mod compose;
pub mod constants;
pub mod convert;
pub mod fallback;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod oneshot;
pub mod proxy;
pub mod redaction_layer;
pub mod specs;
pub mod str_utils;
pub mod streaming;
pub mod tee;
pub mod tool_schema;
pub mod types;
pub mod xml_encode;

pub use types::*;

pub use main_helper::{AppState, Args};
pub use proxy::build_router;
