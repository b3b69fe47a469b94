//! Content association for conversations: which sources feed a conversation,
//! how their fetches are coalesced, and how their text is budgeted.

pub mod archive;
pub mod fetch;
pub mod manager;
pub mod mock;
pub mod subscription;
pub mod text;

pub use archive::ArchivedContent;
pub use fetch::FetchCoordinator;
pub use manager::ContentAssociationManager;
pub use subscription::{ContentObserver, Subscription};
