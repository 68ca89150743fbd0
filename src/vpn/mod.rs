//! Supervision of the VPN subprocess
//!
//! - [`process`]: launching openconnect on a pty and streaming its output
//! - [`classifier`]: turning that output into prompt/connected events
//! - [`terminate`]: SIGTERM/SIGKILL escalation

pub mod classifier;
pub mod process;
pub mod terminate;

pub use classifier::{classify, LineEvent, LineSplitter};
pub use process::{build_args, PtyInput, SupervisorError, VpnProcess};
pub use terminate::{terminate, ProcessControl, TerminationOutcome};
