pub mod google;
pub mod message;
pub mod openai;

pub use message::{ChatMessage, Role};
