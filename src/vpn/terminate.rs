//! Graceful process termination with escalation
//!
//! `Running -> TermSent -> (Exited | KillSent -> Exited)`. SIGTERM first,
//! then SIGKILL if the process has not exited when the grace period runs out.
//! The process is reached through [`ProcessControl`] so tests can drive the
//! state machine with a fake.

use std::io;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Interval between exit checks while waiting
pub const EXIT_POLL: Duration = Duration::from_millis(50);

/// Minimal handle on a child process
pub trait ProcessControl {
    fn pid(&self) -> u32;
    fn send_term(&mut self) -> io::Result<()>;
    fn send_kill(&mut self) -> io::Result<()>;
    /// Non-blocking: reaps and returns true once the process has exited
    fn try_reap(&mut self) -> io::Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationPhase {
    Running,
    TermSent,
    KillSent,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// Exited within the grace period (or was already gone)
    Exited,
    /// Needed SIGKILL
    Killed,
}

pub struct Termination<'a, P: ProcessControl> {
    process: &'a mut P,
    phase: TerminationPhase,
    poll: Duration,
}

impl<'a, P: ProcessControl> Termination<'a, P> {
    pub fn new(process: &'a mut P) -> Self {
        Self {
            process,
            phase: TerminationPhase::Running,
            poll: EXIT_POLL,
        }
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn phase(&self) -> TerminationPhase {
        self.phase
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    /// Running -> TermSent, or straight to Exited if it is already gone
    pub fn send_term(&mut self) {
        if self.reaped() {
            return;
        }
        if let Err(e) = self.process.send_term() {
            debug!("SIGTERM to {} failed: {}", self.process.pid(), e);
        }
        self.phase = TerminationPhase::TermSent;
    }

    /// Wait up to `within` for exit. Returns true once Exited.
    pub async fn wait_exit(&mut self, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            if self.reaped() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.poll).await;
        }
    }

    /// -> KillSent -> Exited. Waits for the reap; SIGKILL cannot be ignored.
    pub async fn kill(&mut self) {
        if self.reaped() {
            return;
        }
        if let Err(e) = self.process.send_kill() {
            warn!("SIGKILL to {} failed: {}", self.process.pid(), e);
        }
        self.phase = TerminationPhase::KillSent;

        while !self.reaped() {
            tokio::time::sleep(self.poll).await;
        }
    }

    fn reaped(&mut self) -> bool {
        if self.phase == TerminationPhase::Exited {
            return true;
        }
        match self.process.try_reap() {
            Ok(true) => {
                self.phase = TerminationPhase::Exited;
                true
            }
            Ok(false) => false,
            Err(e) => {
                // Nothing left to wait for (e.g. ECHILD)
                debug!("wait on {} failed: {}", self.process.pid(), e);
                self.phase = TerminationPhase::Exited;
                true
            }
        }
    }
}

/// SIGTERM, wait `grace`, SIGKILL
pub async fn terminate<P: ProcessControl>(process: &mut P, grace: Duration) -> TerminationOutcome {
    let mut t = Termination::new(process);
    t.send_term();
    if t.wait_exit(grace).await {
        return TerminationOutcome::Exited;
    }
    warn!("Process {} ignored SIGTERM, sending SIGKILL", t.pid());
    t.kill().await;
    TerminationOutcome::Killed
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Scripted stand-in for a child process
    #[derive(Debug, Default)]
    pub(crate) struct FakeProcess {
        pub ignores_term: bool,
        pub already_exited: bool,
        pub signals: Vec<&'static str>,
        pub exited: bool,
    }

    impl ProcessControl for FakeProcess {
        fn pid(&self) -> u32 {
            4242
        }

        fn send_term(&mut self) -> io::Result<()> {
            self.signals.push("TERM");
            if !self.ignores_term {
                self.exited = true;
            }
            Ok(())
        }

        fn send_kill(&mut self) -> io::Result<()> {
            self.signals.push("KILL");
            self.exited = true;
            Ok(())
        }

        fn try_reap(&mut self) -> io::Result<bool> {
            Ok(self.exited || self.already_exited)
        }
    }

    #[tokio::test]
    async fn test_exits_on_term() {
        let mut p = FakeProcess::default();
        let outcome = terminate(&mut p, Duration::from_millis(200)).await;
        assert_eq!(outcome, TerminationOutcome::Exited);
        assert_eq!(p.signals, vec!["TERM"]);
    }

    #[tokio::test]
    async fn test_escalates_to_kill() {
        let mut p = FakeProcess {
            ignores_term: true,
            ..Default::default()
        };
        let start = Instant::now();
        let outcome = terminate(&mut p, Duration::from_millis(150)).await;
        assert_eq!(outcome, TerminationOutcome::Killed);
        assert_eq!(p.signals, vec!["TERM", "KILL"]);
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_already_exited_sends_nothing() {
        let mut p = FakeProcess {
            already_exited: true,
            ..Default::default()
        };
        let outcome = terminate(&mut p, Duration::from_millis(100)).await;
        assert_eq!(outcome, TerminationOutcome::Exited);
        assert!(p.signals.is_empty());
    }

    #[tokio::test]
    async fn test_phases() {
        let mut p = FakeProcess {
            ignores_term: true,
            ..Default::default()
        };
        let mut t = Termination::new(&mut p).with_poll(Duration::from_millis(5));
        assert_eq!(t.phase(), TerminationPhase::Running);

        t.send_term();
        assert_eq!(t.phase(), TerminationPhase::TermSent);
        assert!(!t.wait_exit(Duration::from_millis(20)).await);
        assert_eq!(t.phase(), TerminationPhase::TermSent);

        t.kill().await;
        assert_eq!(t.phase(), TerminationPhase::Exited);
    }
}
