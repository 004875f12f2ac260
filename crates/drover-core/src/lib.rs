//! # drover-core
//!
//! Core engine for drover: a multi-tenant controller that owns a herd of
//! long-lived CLI agent subprocesses (`codex`, `claude`, `gemini`, `qwen`,
//! …) and dispatches prompts into them.
//!
//! The crate is interface-agnostic and can sit behind:
//! - a chat gateway (via [`output::OutputSink`] and [`session::SessionHooks`])
//! - the built-in TCP JSON bridge ([`rpc::RpcBridge`])
//! - anything that can hold an [`dispatch::Dispatcher`]
//!
//! ## Key concepts
//!
//! - **Session**: a persistent `(tool, workdir)` pair, with whatever live
//!   subprocess currently implements it
//! - **Driver**: the subprocess wrapper, one-shot (headless) or persistent
//!   under a pty (interactive)
//! - **Prompt**: one unit of work, queued per session, exactly one in
//!   flight at a time
//!
//! ## Assembly
//!
//! ```ignore
//! let events = Arc::new(EventBus::new());
//! let manager = SessionManager::new(config.clone(), events.clone());
//! let pipeline = OutputPipeline::new(config.defaults.output.clone(), sink, summarizer);
//! let dispatcher = Dispatcher::new(manager.clone(), pipeline, events, config.clone());
//! let bridge = RpcBridge::start(&config.rpc, dispatcher.clone(), manager.clone()).await?;
//! ```

pub mod ansi;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod event_bus;
pub mod matcher;
pub mod output;
pub mod persistence;
pub mod rpc;
pub mod session;
pub mod transcript;

// Re-export commonly used types
pub use config::{AppConfig, ToolConfig, ToolMode};
pub use dispatch::{Dispatcher, PromptRequest, SubmitTicket};
pub use error::{FailureKind, PromptFailure, SessionError};
pub use event_bus::EventBus;
pub use output::{Destination, OutputPipeline, OutputSink, Summarizer};
pub use rpc::RpcBridge;
pub use session::{SessionHooks, SessionId, SessionManager, SessionSnapshot};
