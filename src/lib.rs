//! Embeddable replicated state log: a segmented multi-term append log,
//! a raft-style consensus controller, and a length-framed binary TCP
//! transport between group members.

pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod group;
pub mod io;
pub mod name;
pub mod segment;
pub mod state_log;
pub mod term_log;

pub use channel::ChannelManager;
pub use config::Config;
pub use controller::{Controller, Role};
pub use error::{Error, Result};
pub use group::{GroupMembership, MemberInfo, MemberRole, StaticMembership};
pub use state_log::StateLog;
pub use term_log::{CommitWait, LogReader, LogWriter, TermLog};
