//! Detached terminal sessions driven through a multiplexer binary (tmux).
//!
//! Every operation is one shell-wrapped multiplexer invocation tracked by a
//! [`TrackedProcess`] under its own time budget.

use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use shell_escape::escape;
use tokio::process::Command;

use super::tracker::TrackedProcess;
use crate::config::AppConfig;
use crate::error::Result;
use crate::validation::validate_session_name;

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(60);
const KILL_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// `date`/chrono format of the timestamp in archived output names.
pub const ARCHIVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%SZ";

/// A key in the multiplexer's `send-keys` syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyToken {
    Named(&'static str),
    Literal(char),
}

impl fmt::Display for KeyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
            Self::Literal(c) => write!(f, "{c}"),
        }
    }
}

pub fn key_token(c: char) -> KeyToken {
    match c {
        ' ' => KeyToken::Named("Space"),
        '\n' => KeyToken::Named("Enter"),
        '\t' => KeyToken::Named("Tab"),
        // A bare `;` separates tmux commands.
        ';' => KeyToken::Named("\\;"),
        c => KeyToken::Literal(c),
    }
}

fn quote_path(path: &Path) -> String {
    let path_str = path.to_string_lossy();
    escape(Cow::Borrowed(&path_str)).into_owned()
}

/// Issues session commands through `<shell> -c '<multiplexer> ...'`.
#[derive(Debug, Clone)]
pub struct SessionController {
    shell: String,
    multiplexer: String,
}

impl SessionController {
    pub fn new(shell: impl Into<String>, multiplexer: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            multiplexer: multiplexer.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.shell.clone(), config.multiplexer.clone())
    }

    /// Start `program` in a new detached session, teeing its output to
    /// `output_file`. When the session's shell exits, for whatever reason,
    /// the output file is renamed to a timestamped `.log` archive.
    pub async fn dispatch(&self, session: &str, program: &Path, output_file: &Path) -> Result<()> {
        validate_session_name(session)?;
        let line = self.dispatch_command(session, program, output_file);
        let (process, code) = self.execute(line, "new-session", DISPATCH_TIMEOUT).await?;
        process.ensure_success(code)
    }

    pub async fn kill(&self, session: &str) -> Result<()> {
        validate_session_name(session)?;
        let line = self.command_line(&["kill-session", "-t", session]);
        let (process, code) = self.execute(line, "kill-session", KILL_TIMEOUT).await?;
        process.ensure_success(code)
    }

    pub async fn has_session(&self, session: &str) -> Result<bool> {
        validate_session_name(session)?;
        let line = self.command_line(&["has-session", "-t", session]);
        let (_, code) = self.execute(line, "has-session", QUERY_TIMEOUT).await?;
        Ok(code == 0)
    }

    /// Type `text` into the session, one key per character.
    pub async fn send_input(&self, session: &str, text: &str) -> Result<()> {
        validate_session_name(session)?;
        let line = self.send_keys_command(session, text);
        let (process, code) = self.execute(line, "send-keys", QUERY_TIMEOUT).await?;
        process.ensure_success(code)
    }

    pub async fn send_ctrl_c(&self, session: &str) -> Result<()> {
        validate_session_name(session)?;
        let line = self.command_line(&["send-keys", "-t", session, "C-c"]);
        let (process, code) = self.execute(line, "send-keys", QUERY_TIMEOUT).await?;
        process.ensure_success(code)
    }

    fn command_line(&self, args: &[&str]) -> String {
        let mut line = escape(Cow::Borrowed(self.multiplexer.as_str())).into_owned();
        for arg in args {
            line.push(' ');
            line.push_str(&escape(Cow::Borrowed(*arg)));
        }
        line
    }

    fn send_keys_command(&self, session: &str, text: &str) -> String {
        let mut line = self.command_line(&["send-keys", "-t", session]);
        for c in text.chars() {
            let token = key_token(c).to_string();
            line.push(' ');
            line.push_str(&escape(Cow::Borrowed(token.as_str())));
        }
        line
    }

    /// The pane shell runs the pipeline in the background and waits for it,
    /// so a hangup or TERM interrupts the wait at once. The signal trap then
    /// terminates the whole process group (program and `tee`) and exits,
    /// which runs the archive trap. Stdin is passed through fd 3 because a
    /// background job would otherwise read from `/dev/null`.
    fn dispatch_command(&self, session: &str, program: &Path, output_file: &Path) -> String {
        let output = quote_path(output_file);
        let archive = format!(
            "mv -f {output} {output}.\"$(date -u +{ARCHIVE_TIMESTAMP_FORMAT})\".log"
        );
        let stop = |code: u8| format!("trap '' HUP TERM; kill -TERM 0; exit {code}");
        let script = format!(
            "trap {} EXIT; trap {} HUP; trap {} TERM; exec 3<&0; {} <&3 3<&- 2>&1 | tee {} & wait $!",
            escape(Cow::Borrowed(archive.as_str())),
            escape(Cow::Owned(stop(129))),
            escape(Cow::Owned(stop(143))),
            quote_path(program),
            output
        );

        let start_dir = program
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(|dir| dir.to_string_lossy().into_owned());
        let mut args = vec!["new-session", "-d", "-s", session];
        if let Some(dir) = start_dir.as_deref() {
            args.extend(["-c", dir]);
        }
        args.push(&script);
        self.command_line(&args)
    }

    async fn execute(
        &self,
        line: String,
        label: &str,
        timeout: Duration,
    ) -> Result<(TrackedProcess, i32)> {
        log::debug!("Running: {}", line);
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(&line);
        let mut process = TrackedProcess::spawn(&mut cmd, format!("{} {}", self.multiplexer, label))?;
        let code = process.run_with_timeout(timeout).await?;
        Ok((process, code))
    }
}
