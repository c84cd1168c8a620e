//! Log streaming for kubetap
//!
//! Follows pod container logs, filters and tags each line, and fans out
//! over every pod matching a selection pattern.

mod coordinator;
mod filter;
mod parser;
mod stream;

pub use coordinator::{Coordinator, CoordinatorState, FanOutConfig, FanOutSummary};
pub use filter::LineFilter;
pub use parser::LogParser;
pub use stream::{KubeLogSource, LineStream, LogRequest, LogSource, LogStream};

pub use kubetap_types::{ColorToken, LineKind, LineRecord};
