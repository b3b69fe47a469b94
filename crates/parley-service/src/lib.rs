//! Application layer: the conversation registry, its persistence bridge to
//! the store, and settings loading.

mod bridge;
pub mod error;
pub mod registry;
pub mod settings;

pub use error::{ServiceError, SettingsError};
pub use registry::{ConversationRegistry, RegistryConfig};
pub use settings::{load_settings, load_settings_from_path, ParleySettings};
