//! Message tag parsing and subprocess helpers.
//!
//! Orchestrator messages are UTF-8 text where each parameter is carried on
//! its own line as `#TSI_<NAME> <value>`. The command verb is a bare
//! `#TSI_<VERB>` line.

use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use tracing::debug;

/// Extracts the value of a `#TSI_<parameter> <value>` line. Returns None
/// when the tag is absent or its value is empty.
pub fn extract_parameter<'a>(message: &'a str, parameter: &str) -> Option<&'a str> {
    let tag = format!("#TSI_{parameter} ");
    for line in message.lines() {
        if let Some(value) = line.strip_prefix(&tag) {
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

pub fn parameter_or<'a>(message: &'a str, parameter: &str, default: &'a str) -> &'a str {
    extract_parameter(message, parameter).unwrap_or(default)
}

/// Extracts a numeric tag value, -1 when missing or unparseable.
pub fn extract_number(message: &str, parameter: &str) -> i64 {
    extract_parameter(message, parameter)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .map(|v| v as i64)
        .unwrap_or(-1)
}

/// True when the message carries the bare verb line `#<verb>`.
pub fn has_verb(message: &str, verb: &str) -> bool {
    message.lines().any(|line| {
        let line = line.trim_end();
        line.strip_prefix('#') == Some(verb)
    })
}

/// Expands $HOME, $USER and $LOGNAME from the current environment.
pub fn expand_variables(message: &str) -> String {
    let get = |k: &str| std::env::var(k).unwrap_or_default();
    message
        .replace("$HOME", &get("HOME"))
        .replace("$LOGNAME", &get("LOGNAME"))
        .replace("$USER", &get("USER"))
}

/// Adds mode bits to those already set on the file.
pub fn add_perms(path: &str, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let meta = std::fs::metadata(path).with_context(|| format!("stat {path}"))?;
    let new_mode = meta.permissions().mode() | mode;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(new_mode))
        .with_context(|| format!("chmod {path}"))?;
    Ok(())
}

fn shell(cmd: &str, login_shell: bool) -> Command {
    let mut c = if login_shell {
        let mut c = Command::new("/bin/bash");
        c.arg("-l");
        c
    } else {
        Command::new("/bin/sh")
    };
    c.arg("-c").arg(cmd);
    c
}

/// Runs a command through the shell and captures its output. A non-zero
/// exit status becomes an error quoting the command's output.
pub fn run_command(cmd: &str, login_shell: bool) -> Result<String> {
    debug!("running: {cmd}");
    let out = shell(cmd, login_shell)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("could not run '{cmd}'"))?;
    let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&out.stderr));
    if out.status.success() {
        Ok(text)
    } else {
        let code = out.status.code().unwrap_or(-1);
        Err(anyhow!("Command '{cmd}' failed with code {code}: {text}"))
    }
}

/// Tracks detached children started for background work so they can be
/// reaped without blocking.
#[derive(Default)]
pub struct Children(Mutex<Vec<Child>>);

impl Children {
    pub fn push(&self, child: Child) {
        self.0.lock().unwrap().push(child);
    }

    /// Non-blocking poll of all remembered children, dropping the finished
    /// ones.
    pub fn reap_finished(&self) {
        let mut children = self.0.lock().unwrap();
        children.retain_mut(|c| matches!(c.try_wait(), Ok(None)));
    }
}

/// Starts a command through the shell in a fresh session without waiting
/// for it. Output is discarded unless the command itself redirects it.
pub fn run_detached(cmd: &str, login_shell: bool, children: Option<&Children>) -> Result<u32> {
    debug!("running detached: {cmd}");
    let mut c = shell(cmd, login_shell);
    c.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    unsafe {
        c.pre_exec(|| {
            nix::unistd::setsid()?;
            Ok(())
        });
    }
    let child = c.spawn().with_context(|| format!("could not run '{cmd}'"))?;
    let pid = child.id();
    match children {
        Some(children) => children.push(child),
        None => drop(child),
    }
    Ok(pid)
}

/// Runs a command and reports the outcome on the control channel.
pub fn run_and_report(
    cmd: &str,
    connector: &mut dyn crate::connector::Connector,
    login_shell: bool,
) -> Result<()> {
    match run_command(cmd, login_shell) {
        Ok(output) => connector.ok(Some(&output))?,
        Err(e) => connector.failed(&e.to_string())?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSG: &str = "#TSI_SUBMIT\n#TSI_QUEUE fast\n#TSI_TIME 60\n#TSI_EMPTY \n#TSI_MEMORY 32.5\nbody\n";

    #[test]
    fn extracts_parameters() {
        assert_eq!(extract_parameter(MSG, "QUEUE"), Some("fast"));
        assert_eq!(extract_parameter(MSG, "MISSING"), None);
        assert_eq!(parameter_or(MSG, "MISSING", "dflt"), "dflt");
    }

    #[test]
    fn empty_value_counts_as_missing() {
        assert_eq!(extract_parameter(MSG, "EMPTY"), None);
    }

    #[test]
    fn extracts_numbers() {
        assert_eq!(extract_number(MSG, "TIME"), 60);
        assert_eq!(extract_number(MSG, "MEMORY"), 32);
        assert_eq!(extract_number(MSG, "QUEUE"), -1);
        assert_eq!(extract_number(MSG, "MISSING"), -1);
    }

    #[test]
    fn finds_verbs() {
        assert!(has_verb(MSG, "TSI_SUBMIT"));
        assert!(!has_verb(MSG, "TSI_SUB"));
        assert!(!has_verb(MSG, "TSI_PING"));
    }

    #[test]
    fn expands_environment() {
        std::env::set_var("USER", "alice");
        assert_eq!(expand_variables("hello $USER"), "hello alice");
    }

    #[test]
    fn run_command_captures_output() {
        let out = run_command("echo hi", false).unwrap();
        assert_eq!(out, "hi\n");
    }

    #[test]
    fn run_command_reports_failures() {
        let err = run_command("echo oops >&2; exit 3", false).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("code 3"), "{text}");
        assert!(text.contains("oops"), "{text}");
    }
}
