//! Programs run by server side session channels.
//!
//! A [`CommandFactory`] turns a `shell`, `exec` or `subsystem` request into a
//! [`Program`]. Blocking programs implement [`Command`] and get pipe style
//! stdin/stdout/stderr for use on their own threads; async programs
//! implement [`AsyncCommand`] and get tokio streams.
//!
//! # Example
//!
//! ```rust
//! use fjord_proto::ssh::channel::command::{
//!     AsyncCommand, CommandFactory, Environment, Program, ProgramRequest, StreamIo,
//! };
//! use fjord_platform::FjordResult;
//! use tokio::io::AsyncWriteExt;
//! use tokio::sync::mpsc;
//!
//! struct Echo(String);
//!
//! #[async_trait::async_trait]
//! impl AsyncCommand for Echo {
//!     async fn run(
//!         &mut self,
//!         _env: Environment,
//!         mut io: StreamIo,
//!         _signals: mpsc::UnboundedReceiver<String>,
//!     ) -> u32 {
//!         match io.stdout.write_all(self.0.as_bytes()).await {
//!             Ok(()) => 0,
//!             Err(_) => 1,
//!         }
//!     }
//! }
//!
//! struct EchoFactory;
//!
//! impl CommandFactory for EchoFactory {
//!     fn create_command(&self, request: &ProgramRequest) -> FjordResult<Program> {
//!         match request {
//!             ProgramRequest::Exec(cmd) => Ok(Program::Async(Box::new(Echo(cmd.clone())))),
//!             _ => Err(fjord_platform::FjordError::NotImplemented("only exec".into())),
//!         }
//!     }
//! }
//! ```

use super::stream::{ChannelInput, ChannelOutput, ChannelPipeReader, ChannelPipeWriter};
use crate::ssh::session::handle::Msg;
use crate::ssh::session::SessionHandle;
use async_trait::async_trait;
use fjord_platform::FjordResult;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Terminal mode opcodes (RFC 4254 Section 8) that carry a name.
const PTY_MODE_NAMES: &[(u8, &str)] = &[
    (1, "VINTR"),
    (2, "VQUIT"),
    (3, "VERASE"),
    (4, "VKILL"),
    (5, "VEOF"),
    (6, "VEOL"),
    (7, "VEOL2"),
    (8, "VSTART"),
    (9, "VSTOP"),
    (10, "VSUSP"),
    (11, "VDSUSP"),
    (12, "VREPRINT"),
    (13, "VWERASE"),
    (14, "VLNEXT"),
    (30, "IGNPAR"),
    (31, "PARMRK"),
    (32, "INPCK"),
    (33, "ISTRIP"),
    (34, "INLCR"),
    (35, "IGNCR"),
    (36, "ICRNL"),
    (37, "IUCLC"),
    (38, "IXON"),
    (39, "IXANY"),
    (40, "IXOFF"),
    (41, "IMAXBEL"),
    (50, "ISIG"),
    (51, "ICANON"),
    (52, "XCASE"),
    (53, "ECHO"),
    (54, "ECHOE"),
    (55, "ECHOK"),
    (56, "ECHONL"),
    (57, "NOFLSH"),
    (58, "TOSTOP"),
    (59, "IEXTEN"),
    (60, "ECHOCTL"),
    (61, "ECHOKE"),
    (62, "PENDIN"),
    (70, "OPOST"),
    (71, "OLCUC"),
    (72, "ONLCR"),
    (73, "OCRNL"),
    (74, "ONOCR"),
    (75, "ONLRET"),
    (90, "CS7"),
    (91, "CS8"),
    (92, "PARENB"),
    (93, "PARODD"),
    (128, "TTY_OP_ISPEED"),
    (129, "TTY_OP_OSPEED"),
];

/// Name of a terminal mode opcode.
pub fn pty_mode_name(opcode: u8) -> Option<&'static str> {
    PTY_MODE_NAMES
        .iter()
        .find(|(op, _)| *op == opcode)
        .map(|(_, name)| *name)
}

/// Decodes the encoded terminal modes of a `pty-req`.
///
/// Parsing stops at `TTY_OP_END` (0) or at the first opcode of 160 and
/// above, whose arguments are undefined. Unknown opcodes below 160 are kept
/// under their numeric name.
pub fn parse_pty_modes(encoded: &[u8]) -> BTreeMap<String, u32> {
    let mut modes = BTreeMap::new();
    let mut rest = encoded;
    while let Some((&opcode, tail)) = rest.split_first() {
        if opcode == 0 || opcode >= 160 || tail.len() < 4 {
            break;
        }
        let value = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let name = pty_mode_name(opcode)
            .map(str::to_string)
            .unwrap_or_else(|| opcode.to_string());
        modes.insert(name, value);
        rest = &tail[4..];
    }
    modes
}

/// Pseudo-terminal requested by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PtyInfo {
    /// TERM value
    pub term: String,
    /// Width in characters
    pub columns: u32,
    /// Height in rows
    pub rows: u32,
    /// Width in pixels
    pub width_px: u32,
    /// Height in pixels
    pub height_px: u32,
    /// Terminal modes by name
    pub modes: BTreeMap<String, u32>,
}

/// Environment a program starts with.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    user: Option<String>,
    vars: BTreeMap<String, String>,
    pty: Option<PtyInfo>,
}

impl Environment {
    pub(crate) fn new(user: Option<String>) -> Self {
        Self {
            user,
            ..Self::default()
        }
    }

    /// Authenticated user.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Variables from `env` requests and forwarding setup.
    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Looks up one variable.
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Terminal, if one was requested.
    pub fn pty(&self) -> Option<&PtyInfo> {
        self.pty.as_ref()
    }

    pub(crate) fn set_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub(crate) fn set_pty(&mut self, pty: PtyInfo) {
        self.pty = Some(pty);
    }

    pub(crate) fn resize(&mut self, columns: u32, rows: u32, width_px: u32, height_px: u32) -> bool {
        match self.pty.as_mut() {
            Some(pty) => {
                pty.columns = columns;
                pty.rows = rows;
                pty.width_px = width_px;
                pty.height_px = height_px;
                true
            }
            None => false,
        }
    }
}

/// Reports a program's exit status. Only the first report counts.
#[derive(Clone)]
pub struct ExitCallback {
    id: u32,
    session: SessionHandle,
    reported: Arc<AtomicBool>,
}

impl std::fmt::Debug for ExitCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitCallback")
            .field("channel", &self.id)
            .field("reported", &self.is_reported())
            .finish()
    }
}

impl ExitCallback {
    pub(crate) fn new(id: u32, session: SessionHandle) -> Self {
        Self {
            id,
            session,
            reported: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sends `exit-status`, then EOF and CLOSE. Later calls do nothing.
    pub fn on_exit(&self, status: u32) {
        if self.reported.swap(true, Ordering::SeqCst) {
            return;
        }
        // the session may already be gone
        let _ = self.session.send(Msg::CommandExited {
            id: self.id,
            status,
        });
    }

    /// True once an exit was reported.
    pub fn is_reported(&self) -> bool {
        self.reported.load(Ordering::SeqCst)
    }
}

/// Blocking standard streams.
pub struct PipeIo {
    /// Data sent by the client
    pub stdin: ChannelPipeReader,
    /// Regular channel data
    pub stdout: ChannelPipeWriter,
    /// Extended data of type 1
    pub stderr: ChannelPipeWriter,
}

/// Async standard streams.
pub struct StreamIo {
    /// Data sent by the client
    pub stdin: ChannelInput,
    /// Regular channel data
    pub stdout: ChannelOutput,
    /// Extended data of type 1
    pub stderr: ChannelOutput,
}

/// A program that runs on its own threads.
///
/// `start` must return promptly; the program reports completion through the
/// [`ExitCallback`].
pub trait Command: Send {
    /// Starts the program.
    fn start(&mut self, env: &Environment, io: PipeIo, exit: ExitCallback) -> FjordResult<()>;

    /// Delivers a signal, name without `SIG`.
    fn signal(&mut self, _signal: &str) {}

    /// Asks the program to stop; called when the client closes the channel.
    fn destroy(&mut self) {}
}

/// A program that runs as a tokio task.
///
/// The returned value is sent as the exit status. Signals arrive on
/// `signals`. When the client closes the channel the task is aborted.
#[async_trait]
pub trait AsyncCommand: Send {
    /// Runs the program to completion.
    async fn run(
        &mut self,
        env: Environment,
        io: StreamIo,
        signals: mpsc::UnboundedReceiver<String>,
    ) -> u32;
}

/// A program ready to start.
pub enum Program {
    /// Uses blocking pipes.
    Blocking(Box<dyn Command>),
    /// Uses async streams.
    Async(Box<dyn AsyncCommand>),
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Program::Blocking(_) => f.write_str("Program::Blocking"),
            Program::Async(_) => f.write_str("Program::Async"),
        }
    }
}

/// What the client asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramRequest {
    /// Interactive shell
    Shell,
    /// Command line
    Exec(String),
    /// Named subsystem
    Subsystem(String),
}

/// Creates programs for session channels.
pub trait CommandFactory: Send + Sync {
    /// Creates the program for a request. An error answers the request with
    /// failure and leaves the channel open.
    fn create_command(&self, request: &ProgramRequest) -> FjordResult<Program>;
}

/// Program running on a channel, as tracked by the session loop.
pub(crate) enum RunningCommand {
    Blocking(Box<dyn Command>),
    Async {
        signals: mpsc::UnboundedSender<String>,
        task: tokio::task::JoinHandle<()>,
    },
}

impl RunningCommand {
    pub(crate) fn signal(&mut self, signal: &str) {
        match self {
            RunningCommand::Blocking(command) => command.signal(signal),
            RunningCommand::Async { signals, .. } => {
                // a finished task no longer listens
                let _ = signals.send(signal.to_string());
            }
        }
    }

    /// Stops the program. Returns true if it is gone already.
    pub(crate) fn destroy(&mut self) -> bool {
        match self {
            RunningCommand::Blocking(command) => {
                command.destroy();
                false
            }
            RunningCommand::Async { task, .. } => {
                task.abort();
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pty_modes() {
        // VINTR=3, ECHO=1, ICANON=0, TTY_OP_OSPEED=38400, end
        let mut encoded = vec![1, 0, 0, 0, 3, 53, 0, 0, 0, 1, 51, 0, 0, 0, 0, 129];
        encoded.extend_from_slice(&38400u32.to_be_bytes());
        encoded.push(0);
        encoded.extend_from_slice(&[53, 0, 0, 0, 0]);

        let modes = parse_pty_modes(&encoded);
        assert_eq!(modes.get("VINTR"), Some(&3));
        assert_eq!(modes.get("ECHO"), Some(&1));
        assert_eq!(modes.get("ICANON"), Some(&0));
        assert_eq!(modes.get("TTY_OP_OSPEED"), Some(&38400));
        assert_eq!(modes.len(), 4);
    }

    #[test]
    fn test_parse_pty_modes_truncated_and_unknown() {
        let modes = parse_pty_modes(&[99, 0, 0, 0, 7, 53, 0, 0]);
        assert_eq!(modes.get("99"), Some(&7));
        assert_eq!(modes.len(), 1);
        assert!(parse_pty_modes(&[200, 0, 0, 0, 1]).is_empty());
    }

    #[test]
    fn test_environment_resize_requires_pty() {
        let mut env = Environment::new(Some("alice".into()));
        assert!(!env.resize(100, 40, 0, 0));
        env.set_pty(PtyInfo {
            term: "xterm".into(),
            columns: 80,
            rows: 24,
            ..PtyInfo::default()
        });
        assert!(env.resize(100, 40, 0, 0));
        assert_eq!(env.pty().unwrap().columns, 100);
        env.set_var("LANG", "C");
        assert_eq!(env.var("LANG"), Some("C"));
        assert_eq!(env.user(), Some("alice"));
    }

    #[tokio::test]
    async fn test_exit_reported_once() {
        let (handle, mut rx) = crate::ssh::session::tests::detached_handle();
        let exit = ExitCallback::new(7, handle);
        exit.on_exit(0);
        exit.clone().on_exit(1);
        assert!(exit.is_reported());
        match rx.try_recv() {
            Ok(Msg::CommandExited { id, status }) => assert_eq!((id, status), (7, 0)),
            _ => panic!("expected one exit"),
        }
        assert!(rx.try_recv().is_err());
    }
}
