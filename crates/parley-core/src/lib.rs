pub mod content;
pub mod conversation;
pub mod engine;
pub mod errors;
pub mod events;
pub mod ids;
pub mod suggestion;
pub mod turn;
