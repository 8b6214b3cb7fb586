//! Deep Research Orchestrator
//!
//! Autonomous, multi-step research: query a remote research agent, detect
//! gaps in the resulting report, recursively spawn bounded parallel
//! sub-investigations to fill them, and merge everything into one report.
//! Every task (root or child) is a durable session row, so progress and
//! results survive process restarts and detached background runs.
//!
//! # Architecture
//!
//! ```text
//! CLI ──► Orchestrator ──► Gemini Interactions API
//!              │                  (stream + follow-up)
//!              ├── SessionStore (SQLite WAL: task tree, status, reports)
//!              ├── StreamConsumer (resume + bounded backoff)
//!              └── Detacher (headless runs, pid liveness)
//! ```

pub mod config;
pub mod detach;
pub mod error;
pub mod gemini;
pub mod orchestrator;
pub mod session;
pub mod stream;

pub use config::Config;
pub use detach::Detacher;
pub use error::{ResearchError, Result};
pub use gemini::{GeminiBackend, Generation, ResearchBackend, StreamEvent, StreamEventKind, StreamRequest};
pub use orchestrator::{Orchestrator, ResearchRequest};
pub use session::{ListedSession, Session, SessionFilter, SessionStore, Status};
pub use stream::{RetryPolicy, StdoutSink, StreamConsumer, StreamOutcome, StreamSink, TracingSink};
