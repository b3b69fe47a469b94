pub mod assembler;
pub mod context;
pub mod error;
pub mod mock;
pub mod models;
pub mod session;
pub mod suggestions;

pub use assembler::{AssemblyOutcome, ResponseAssembler};
pub use context::AppContext;
pub use error::SessionError;
pub use session::{ClientGuard, ConversationSession, RequestPhase, SessionSnapshot, SubmitOutcome};
