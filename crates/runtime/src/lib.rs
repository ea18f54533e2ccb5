//! Distributed runtime for compiled Modular PlusCal archetypes
//!
//! The compiler front-end emits ordinary sequential code; this crate is
//! what that code runs on. It provides atomic multi-resource critical
//! sections spanning network mailboxes, local state, and host-visible I/O,
//! surviving peer crashes, buffer contention, and process shutdown.
//!
//! Key design principles:
//! - The driver loop owns commit and abort; generated bodies are plain
//!   functions from (context, label) to the next label
//! - Every piece of external state implements one `Resource` trait with
//!   per-resource shadow state; atomicity is the pre-commit unanimity gate,
//!   not a distributed transaction manager
//! - Everything that blocks does so on May coroutines, so archetypes,
//!   listeners, pollers, and heartbeats are cheap to stack into one process

pub mod channel;
pub mod context;
pub mod error;
pub mod failure_detector;
pub mod mailboxes;
pub mod monitor;
pub mod placeholder;
pub mod register;
pub mod resource;
pub mod wire;

// Re-export key types and functions
pub use channel::{ChannelReader, ChannelWriter, input_channel, output_channel};
pub use context::{
    ArchetypeBody, ArchetypeContext, ArchetypeContextBuilder, CloseHandle, Label, ResourceHandle,
    Step, init_coroutine_runtime,
};
pub use error::{Result, RuntimeError};
pub use failure_detector::{FailureDetectorConfig, failure_detector};
pub use mailboxes::{MailboxConfig, MailboxKind, tcp_mailboxes};
pub use monitor::{Monitor, MonitorClient, MonitorConfig, MonitorReply};
pub use placeholder::Placeholder;
pub use register::LocalRegister;
pub use resource::{Resource, ResourceEnv, ResourceMaker, ResourceMap};

// The value algebra, re-exported so generated code depends on one crate.
pub use mpcal_core as core;
pub use mpcal_core::Value;
