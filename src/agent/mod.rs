//! Agent invocation boundary
//!
//! The orchestration core only ever talks to an agent through
//! [`AgentInvoker`]. What comes back is raw text; the task runner turns it
//! into an [`AgentOutcome`] before any other component sees it.

pub mod http;
pub mod invoker;
pub mod outcome;

pub use http::HttpAgentInvoker;
pub use invoker::{AgentInvoker, AgentRegistry};
pub use outcome::AgentOutcome;
