//! Host process listing and termination

use async_trait::async_trait;
use regex::Regex;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{ProcessError, ProcessResult};

/// Identifies a converter process in the host process list.
///
/// A process matches when its command line mentions both the executable
/// name and the argument (the endpoint's accept string).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessQuery {
    pub command: String,
    pub argument: String,
}

impl ProcessQuery {
    pub fn new(command: impl Into<String>, argument: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            argument: argument.into(),
        }
    }

    pub fn matches(&self, command_line: &str) -> bool {
        command_line.contains(&self.command) && command_line.contains(&self.argument)
    }
}

impl fmt::Display for ProcessQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.command, self.argument)
    }
}

/// Queries and kills host processes
#[async_trait]
pub trait ProcessManager: Send + Sync + fmt::Debug {
    /// PID of the first process matching `query`
    async fn find_pid(&self, query: &ProcessQuery) -> ProcessResult<Option<u32>>;

    /// Kill a process by force
    async fn kill(&self, pid: u32) -> ProcessResult<()>;
}

/// Process manager for the platform we run on
pub fn default_process_manager() -> Arc<dyn ProcessManager> {
    if cfg!(windows) {
        Arc::new(WindowsProcessManager)
    } else {
        Arc::new(UnixProcessManager)
    }
}

/// `ps` and `kill` based manager
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixProcessManager;

#[async_trait]
impl ProcessManager for UnixProcessManager {
    async fn find_pid(&self, query: &ProcessQuery) -> ProcessResult<Option<u32>> {
        let output = run_command("ps", &["-e", "-o", "pid=,args="]).await?;
        let pid = parse_ps_output(&output, query);
        trace!(%query, ?pid, "Process lookup");
        Ok(pid)
    }

    async fn kill(&self, pid: u32) -> ProcessResult<()> {
        debug!(pid, "Killing process");
        run_command("kill", &["-KILL", &pid.to_string()]).await?;
        Ok(())
    }
}

/// `wmic` and `taskkill` based manager
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsProcessManager;

#[async_trait]
impl ProcessManager for WindowsProcessManager {
    async fn find_pid(&self, query: &ProcessQuery) -> ProcessResult<Option<u32>> {
        let filter = format!("name='{}'", query.command);
        let output = run_command(
            "wmic",
            &[
                "process",
                "where",
                &filter,
                "get",
                "CommandLine,ProcessId",
                "/format:list",
            ],
        )
        .await?;
        let pid = parse_wmic_output(&output, query);
        trace!(%query, ?pid, "Process lookup");
        Ok(pid)
    }

    async fn kill(&self, pid: u32) -> ProcessResult<()> {
        debug!(pid, "Killing process");
        run_command("taskkill", &["/F", "/PID", &pid.to_string()]).await?;
        Ok(())
    }
}

async fn run_command(program: &str, args: &[&str]) -> ProcessResult<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| ProcessError::Command {
            command: program.to_string(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(ProcessError::Command {
            command: format!("{} {}", program, args.join(" ")),
            message: format!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn ps_line() -> &'static Regex {
    static PS_LINE: OnceLock<Regex> = OnceLock::new();
    PS_LINE.get_or_init(|| Regex::new(r"^\s*(\d+)\s+(.*)$").expect("valid ps line pattern"))
}

/// Find the first matching PID in `ps -o pid=,args=` output
pub(crate) fn parse_ps_output(output: &str, query: &ProcessQuery) -> Option<u32> {
    output.lines().find_map(|line| {
        let captures = ps_line().captures(line)?;
        let args = captures.get(2)?.as_str();
        if query.matches(args) {
            captures.get(1)?.as_str().parse().ok()
        } else {
            None
        }
    })
}

/// Find the first matching PID in `wmic ... /format:list` output
pub(crate) fn parse_wmic_output(output: &str, query: &ProcessQuery) -> Option<u32> {
    let mut command_line: Option<&str> = None;

    for line in output.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("CommandLine=") {
            command_line = Some(value);
        } else if let Some(value) = line.strip_prefix("ProcessId=") {
            let matched = command_line.take().is_some_and(|cmd| query.matches(cmd));
            if matched {
                if let Ok(pid) = value.parse() {
                    return Some(pid);
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> ProcessQuery {
        ProcessQuery::new(
            "soffice",
            "socket,host=127.0.0.1,port=2002,tcpNoDelay=1",
        )
    }

    #[test]
    fn test_parse_ps_output() {
        let output = "\
    1 /sbin/init
  812 /usr/lib/libreoffice/program/soffice.bin -accept=socket,host=127.0.0.1,port=2003,tcpNoDelay=1;urp; -headless
  977 /usr/lib/libreoffice/program/soffice.bin -accept=socket,host=127.0.0.1,port=2002,tcpNoDelay=1;urp; -headless
 1002 grep soffice
";
        assert_eq!(parse_ps_output(output, &query()), Some(977));
    }

    #[test]
    fn test_parse_ps_output_without_match() {
        let output = "  1 /sbin/init\n 44 /usr/bin/bash\n";
        assert_eq!(parse_ps_output(output, &query()), None);
        assert_eq!(parse_ps_output("", &query()), None);
    }

    #[test]
    fn test_parse_wmic_output() {
        let output = "\r\n\r\nCommandLine=\"C:\\LibreOffice\\program\\soffice.bin\" -accept=socket,host=127.0.0.1,port=2003,tcpNoDelay=1;urp;\r\nProcessId=4100\r\n\r\nCommandLine=\"C:\\LibreOffice\\program\\soffice.bin\" -accept=socket,host=127.0.0.1,port=2002,tcpNoDelay=1;urp;\r\nProcessId=4242\r\n";
        assert_eq!(parse_wmic_output(output, &query()), Some(4242));
    }

    #[test]
    fn test_query_needs_both_parts() {
        let query = query();
        assert!(!query.matches("soffice -headless"));
        assert!(!query.matches("python socket,host=127.0.0.1,port=2002,tcpNoDelay=1"));
    }
}
