//! Sessions: the durable association between a tool and a workdir, plus
//! whatever live subprocess currently implements it.

pub mod manager;
pub mod state;

pub use manager::{SessionHooks, SessionManager};
pub use state::{PendingPrompt, PromptResult, Session, SessionId, SessionSnapshot};
