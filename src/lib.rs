pub mod call;
pub mod config;
pub mod error;
pub mod event;
pub mod fixtures;
pub mod media;
pub mod notify;
pub mod store;

pub type UserId = String;
pub type CallId = String;
pub type ConversationId = String;

// get timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}
