//! VPN subprocess on a pseudo-terminal
//!
//! openconnect only prints its interactive prompts when attached to a
//! terminal, so it runs on a pty. The master side is put into raw mode (no
//! echo of typed passwords, no CR/LF translation) and read from a dedicated
//! thread that hands byte chunks to the async side over a bounded channel.

use super::terminate::ProcessControl;
use crate::config::Connection;
use crate::ipc::protocol::ErrorCode;
use nix::sys::signal::{kill, Signal};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{self, Read, Write};
use std::os::fd::BorrowedFd;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Chunks buffered between the pty reader thread and the line splitter
const OUTPUT_CHANNEL_CAPACITY: usize = 64;
const READ_BUF_SIZE: usize = 1024;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to allocate pseudo-terminal: {0}")]
    Pty(String),
    #[error("Failed to set pseudo-terminal raw mode: {0}")]
    RawMode(#[from] nix::Error),
    #[error("Failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },
}

impl SupervisorError {
    /// Error code reported to the client
    pub fn code(&self) -> ErrorCode {
        match self {
            SupervisorError::Spawn { .. } => ErrorCode::StartFailed,
            SupervisorError::Pty(_) | SupervisorError::RawMode(_) => ErrorCode::PtyFailed,
        }
    }
}

/// openconnect arguments for a profile
pub fn build_args(conn: &Connection, has_password: bool) -> Vec<String> {
    let mut args = vec![format!("--protocol={}", conn.protocol), conn.host.clone()];

    if !conn.username.is_empty() {
        args.push(format!("--user={}", conn.username));
    }

    if has_password {
        args.push("--passwd-on-stdin".to_string());
    }

    args.extend(conn.flags.split_whitespace().map(String::from));
    args
}

/// Shell-style rendering for the session log
pub fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A running VPN subprocess and its pty
pub struct VpnProcess {
    pid: u32,
    child: Box<dyn Child + Send + Sync>,
    // Closing the master hangs up the session
    _master: Box<dyn MasterPty + Send>,
    input: PtyInput,
}

/// Shared handle to the pty's input side. Writes can block on a full pty
/// buffer, so async callers use [`PtyInput::send_line`].
#[derive(Clone)]
pub struct PtyInput(Arc<Mutex<Box<dyn Write + Send>>>);

impl PtyInput {
    fn new(writer: Box<dyn Write + Send>) -> Self {
        Self(Arc::new(Mutex::new(writer)))
    }

    /// Write `value` plus a newline to the process's terminal
    pub fn write_line(&self, value: &str) -> io::Result<()> {
        let mut writer = self
            .0
            .lock()
            .map_err(|_| io::Error::other("pty writer lock poisoned"))?;
        writer.write_all(value.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    /// [`PtyInput::write_line`] on the blocking pool
    pub async fn send_line(&self, value: String) -> io::Result<()> {
        let input = self.clone();
        tokio::task::spawn_blocking(move || input.write_line(&value))
            .await
            .map_err(io::Error::other)?
    }
}

impl std::fmt::Debug for VpnProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VpnProcess").field("pid", &self.pid).finish()
    }
}

/// Receives raw output until the pty reports EOF or an error, which is how
/// process exit shows up
pub type OutputReceiver = mpsc::Receiver<Vec<u8>>;

impl VpnProcess {
    /// Launch `program` on a fresh pty. Blocks while the pty is opened and the
    /// child forked; see [`VpnProcess::start`] for async callers.
    pub fn spawn(program: &str, args: &[String]) -> Result<(Self, OutputReceiver), SupervisorError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 200,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SupervisorError::Pty(e.to_string()))?;

        set_raw_mode(pair.master.as_ref())?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SupervisorError::Spawn {
                program: program.to_string(),
                reason: e.to_string(),
            })?;
        // Our copy of the slave must go, or the master never sees EOF
        drop(pair.slave);

        let pid = child.process_id().unwrap_or(0);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SupervisorError::Pty(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SupervisorError::Pty(e.to_string()))?;

        let rx = spawn_reader(reader, pid).map_err(|e| SupervisorError::Pty(e.to_string()))?;

        Ok((
            Self {
                pid,
                child,
                _master: pair.master,
                input: PtyInput::new(writer),
            },
            rx,
        ))
    }

    /// [`VpnProcess::spawn`] on the blocking pool
    pub async fn start(
        program: String,
        args: Vec<String>,
    ) -> Result<(Self, OutputReceiver), SupervisorError> {
        tokio::task::spawn_blocking(move || Self::spawn(&program, &args))
            .await
            .map_err(|e| SupervisorError::Pty(e.to_string()))?
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn input(&self) -> PtyInput {
        self.input.clone()
    }
}

impl ProcessControl for VpnProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn send_term(&mut self) -> io::Result<()> {
        signal_pid(self.pid, Signal::SIGTERM)
    }

    fn send_kill(&mut self) -> io::Result<()> {
        signal_pid(self.pid, Signal::SIGKILL)
    }

    fn try_reap(&mut self) -> io::Result<bool> {
        Ok(self.child.try_wait()?.is_some())
    }
}

/// Send `signal` to `pid`. A process that is already gone is not an error.
pub fn signal_pid(pid: u32, signal: Signal) -> io::Result<()> {
    let Ok(raw) = i32::try_from(pid) else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"));
    };
    if raw <= 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"));
    }
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::from(e)),
    }
}

/// Is `pid` alive (signal 0 probe)?
pub fn pid_alive(pid: u32) -> bool {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => kill(Pid::from_raw(raw), None).is_ok(),
        _ => false,
    }
}

fn set_raw_mode(master: &(dyn MasterPty + Send)) -> Result<(), SupervisorError> {
    let Some(raw_fd) = master.as_raw_fd() else {
        return Err(SupervisorError::Pty("pty master has no file descriptor".to_string()));
    };
    // SAFETY: `master` owns the descriptor and outlives this borrow
    let fd = unsafe { BorrowedFd::borrow_raw(raw_fd) };
    let mut termios = tcgetattr(fd)?;
    cfmakeraw(&mut termios);
    tcsetattr(fd, SetArg::TCSANOW, &termios)?;
    Ok(())
}

fn spawn_reader(mut reader: Box<dyn Read + Send>, pid: u32) -> io::Result<OutputReceiver> {
    let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

    std::thread::Builder::new()
        .name(format!("vpn-pty-{}", pid))
        .spawn(move || {
            let mut buf = [0u8; READ_BUF_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            // Nobody is listening any more
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("pty read for {} ended: {}", pid, e);
                        break;
                    }
                }
            }
        })?;

    Ok(rx)
}
