#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! rmctl — client engine for a remote management server's control protocol.
//!
//! One [`Session`] holds one persistent WebSocket to the server and lets
//! many callers issue independently-tracked operations over it. Per managed
//! node, secondary relay connections carry interactive terminal bytes
//! ([`Shell`], [`SmartShell`]) or the chunked file-transfer sub-protocol
//! ([`Files`]).
//!
//! - `session` — the primary connection: auth, bootstrap, request
//!   correlation, event subscriptions, tunnel factories
//! - `dispatch` — correlation table and event bus
//! - `filter` — structural predicates over event frames
//! - `tunnel` — node-scoped relay connections and their handshake
//! - `files` — file listing, management, upload and download
//! - `shell` — buffered read/expect scripting over a terminal tunnel
//! - `error` — the crate-wide failure taxonomy

pub mod dispatch;
pub mod error;
pub mod files;
pub mod filter;
pub mod session;
pub mod shell;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use dispatch::{BusEvent, CorrelationTable, EventBus, SubscriptionToken, Topic};
pub use error::Error;
pub use files::{DownloadOutcome, Files};
pub use filter::EventFilter;
pub use session::{Credentials, Secret, Session, SessionOptions};
pub use shell::{Shell, SmartShell};
pub use tunnel::{Tunnel, TunnelProtocol};
