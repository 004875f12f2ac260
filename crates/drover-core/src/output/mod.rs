//! Output delivery: destinations, messages, and the seams the host plugs
//! into.
//!
//! The core never talks to a chat service itself. Completed outputs are
//! shaped (sanitised, truncated, rendered) by the [`pipeline`] and handed
//! to an [`OutputSink`] the host supplies. An optional [`Summarizer`] lets
//! the host condense oversize outputs before the rendered artifact goes
//! out.

pub mod pipeline;

pub use pipeline::OutputPipeline;

use crate::session::SessionId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where a session's output goes. Per destination, delivery order matches
/// emission order; messages from different sessions interleave only at
/// message boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Destination {
    /// A chat channel.
    Chat { chat_id: i64 },
    /// An RPC caller awaiting the result synchronously; nothing flows
    /// through the pipeline.
    Rpc,
    /// A host-defined endpoint.
    Named { name: String },
}

impl Destination {
    /// Synchronous destinations get the result on the submit ticket and
    /// bypass the pipeline.
    pub fn is_synchronous(&self) -> bool {
        matches!(self, Destination::Rpc)
    }
}

/// One message handed to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// Short output delivered as-is.
    Inline { text: String },
    /// Host-produced summary of an oversize output; always delivered
    /// before the artifact it describes.
    Summary { text: String },
    /// Oversize output: a head/tail preview plus the rendered HTML file.
    Artifact { preview: String, path: PathBuf },
}

/// Host-supplied delivery endpoint.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn deliver(&self, dest: &Destination, session: &SessionId, message: OutboundMessage);
}

/// Host-supplied summariser for oversize outputs.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<String, String>;
}
