pub mod http;
pub mod types;
pub mod unified;
