//! The worker's message loop.
//!
//! Each message selects exactly one `#TSI_<VERB>` handler. Unless the verb
//! is a ping, the worker assumes the identity given in `#TSI_IDENTITY`
//! before the handler runs and restores its privileged identity afterwards
//! on every path. Handler failures are reported as `TSI_FAILED: ...` and
//! never break the loop; a closed peer ends the worker cleanly. Every
//! reply is terminated with a single `ENDOFMESSAGE` line.

use anyhow::{anyhow, Context, Result};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult};
use tracing::{debug, info, warn};

use crate::bss::{self, BatchSystem};
use crate::cache::UserCache;
use crate::config::Config;
use crate::connector::Connector;
use crate::identity::{HostOs, IdentityOps, UserSwitch};
use crate::msg::{
    expand_variables, extract_parameter, has_verb, parameter_or, run_command, run_detached,
    Children,
};
use crate::session::PamSession;
use crate::{acl, fileops, reservation, uftp, TSI_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Ping,
    PingUid,
    GetUserInfo,
    ExecuteScript,
    GetFileChunk,
    PutFileChunk,
    Ls,
    Df,
    Uftp,
    Submit,
    RunOnLoginNode,
    GetStatusListing,
    GetProcessListing,
    GetJobDetails,
    GetPartitions,
    AbortJob,
    HoldJob,
    ResumeJob,
    GetComputeBudget,
    MakeReservation,
    QueryReservation,
    CancelReservation,
    FileAcl,
}

const VERBS: &[(&str, Verb)] = &[
    ("TSI_PING", Verb::Ping),
    ("TSI_PING_UID", Verb::PingUid),
    ("TSI_GET_USER_INFO", Verb::GetUserInfo),
    ("TSI_EXECUTESCRIPT", Verb::ExecuteScript),
    ("TSI_GETFILECHUNK", Verb::GetFileChunk),
    ("TSI_PUTFILECHUNK", Verb::PutFileChunk),
    ("TSI_LS", Verb::Ls),
    ("TSI_DF", Verb::Df),
    ("TSI_UFTP", Verb::Uftp),
    ("TSI_SUBMIT", Verb::Submit),
    ("TSI_RUN_ON_LOGIN_NODE", Verb::RunOnLoginNode),
    ("TSI_GETSTATUSLISTING", Verb::GetStatusListing),
    ("TSI_GETPROCESSLISTING", Verb::GetProcessListing),
    ("TSI_GETJOBDETAILS", Verb::GetJobDetails),
    ("TSI_GET_PARTITIONS", Verb::GetPartitions),
    ("TSI_ABORTJOB", Verb::AbortJob),
    ("TSI_HOLDJOB", Verb::HoldJob),
    ("TSI_RESUMEJOB", Verb::ResumeJob),
    ("TSI_GET_COMPUTE_BUDGET", Verb::GetComputeBudget),
    ("TSI_MAKE_RESERVATION", Verb::MakeReservation),
    ("TSI_QUERY_RESERVATION", Verb::QueryReservation),
    ("TSI_CANCEL_RESERVATION", Verb::CancelReservation),
    ("TSI_FILE_ACL", Verb::FileAcl),
];

impl Verb {
    fn find(message: &str) -> Option<Verb> {
        VERBS
            .iter()
            .find(|(tag, _)| has_verb(message, tag))
            .map(|(_, verb)| *verb)
    }

    fn skips_identity(self) -> bool {
        matches!(self, Verb::Ping | Verb::PingUid)
    }

    /// Verbs that launch work which should live inside a login session.
    fn wants_session(self) -> bool {
        matches!(
            self,
            Verb::ExecuteScript | Verb::RunOnLoginNode | Verb::Submit | Verb::Uftp
        )
    }
}

struct Worker {
    config: Config,
    switch: UserSwitch<HostOs>,
    cache: UserCache,
    bss: Box<dyn BatchSystem>,
    pam: PamSession,
    children: Children,
}

impl Worker {
    fn new(config: Config) -> Result<Self> {
        let bss = bss::select(&config.batch_variant)?;
        let switch = UserSwitch::initialize(HostOs, &config)?;
        let cache = UserCache::new(config.user_cache_ttl, config.use_id_to_resolve_gids);
        let pam = PamSession::new(&config.pam_module);
        Ok(Self {
            config,
            switch,
            cache,
            bss,
            pam,
            children: Children::default(),
        })
    }

    fn invoke(&mut self, verb: Verb, message: &str, conn: &mut dyn Connector) -> Result<()> {
        match verb {
            Verb::Ping => conn.write_message(TSI_VERSION).map_err(Into::into),
            Verb::PingUid => {
                conn.write_message(TSI_VERSION)?;
                let uid = HostOs.resuid().map(|(_, e, _)| e).unwrap_or(0);
                conn.write_message(&format!(" running as UID [{uid}]"))?;
                Ok(())
            }
            Verb::GetUserInfo => self.get_user_info(message, conn),
            Verb::ExecuteScript => self.execute_script(message, conn),
            Verb::GetFileChunk => fileops::get_file_chunk(message, conn),
            Verb::PutFileChunk => fileops::put_file_chunk(message, conn),
            Verb::Ls => fileops::ls(message, conn),
            Verb::Df => fileops::df(message, conn, &self.config),
            Verb::Uftp => uftp::uftp(message, conn, &self.config),
            Verb::Submit => self.bss.submit(message, conn, &self.config, &self.children),
            Verb::RunOnLoginNode => self.run_on_login_node(message, conn),
            Verb::GetStatusListing => self.bss.get_status_listing(conn, &self.config),
            Verb::GetProcessListing => self.bss.get_process_listing(message, conn, &self.config),
            Verb::GetJobDetails => self.bss.get_job_details(message, conn, &self.config),
            Verb::GetPartitions => self.bss.get_partitions(conn, &self.config),
            Verb::AbortJob => self.bss.abort_job(message, conn, &self.config),
            Verb::HoldJob => self.bss.hold_job(message, conn, &self.config),
            Verb::ResumeJob => self.bss.resume_job(message, conn, &self.config),
            Verb::GetComputeBudget => self.bss.get_budget(conn, &self.config),
            Verb::MakeReservation => reservation::make_reservation(message, conn),
            Verb::QueryReservation => reservation::query_reservation(message, conn),
            Verb::CancelReservation => reservation::cancel_reservation(message, conn),
            Verb::FileAcl => acl::process_acl(message, conn, &self.config),
        }
    }

    /// Runs a script with the shell, returning its output unless the
    /// message asks for it to be discarded (then the script runs detached).
    fn execute_script(&mut self, message: &str, conn: &mut dyn Connector) -> Result<()> {
        let discard = message.contains("#TSI_DISCARD_OUTPUT true\n");
        if discard {
            run_detached(message, self.config.use_login_shell, Some(&self.children))?;
            conn.ok(None)?;
        } else {
            let output = run_command(message, self.config.use_login_shell)?;
            conn.ok(Some(&output))?;
        }
        Ok(())
    }

    /// Reports the user's home directory and the public keys accepted for
    /// them, read from the configured key files.
    fn get_user_info(&mut self, _message: &str, conn: &mut dyn Connector) -> Result<()> {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        let mut response = format!("home: {home}");
        let mut index = 1;
        for keyfile in &self.config.keyfiles {
            let path = std::path::Path::new(&home).join(keyfile);
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                response.push_str(&format!("\nAccepted key {index}: {line}"));
                index += 1;
            }
        }
        conn.ok(Some(&response))?;
        Ok(())
    }

    /// Launches a script detached on this login node, recording pid and
    /// exit code in files the orchestrator polls.
    fn run_on_login_node(&mut self, message: &str, conn: &mut dyn Connector) -> Result<()> {
        let message = expand_variables(message);
        let uspace_dir = extract_parameter(&message, "USPACE_DIR")
            .ok_or_else(|| anyhow!("missing TSI_USPACE_DIR"))?;
        std::env::set_current_dir(uspace_dir)
            .with_context(|| format!("cannot enter job directory {uspace_dir}"))?;
        let outcome_dir = parameter_or(&message, "OUTCOME_DIR", ".");
        let stdout = parameter_or(&message, "STDOUT", "stdout");
        let stderr = parameter_or(&message, "STDERR", "stderr");
        let pid_file = parameter_or(&message, "PID_FILE", "UNICORE_SCRIPT_PID");
        let exit_code_file = parameter_or(&message, "EXIT_CODE_FILE", "UNICORE_SCRIPT_EXIT_CODE");

        let script = format!("UNICORE_LoginNode_{}", std::process::id());
        std::fs::write(&script, &message).with_context(|| format!("cannot write {script}"))?;
        crate::msg::add_perms(&script, 0o700)?;
        let cmd = format!(
            "{{ ./{script} > {outcome_dir}/{stdout} 2> {outcome_dir}/{stderr} ; \
             echo $? > {exit_code_file} ; }} & echo $! > {pid_file}"
        );
        run_detached(&cmd, self.config.use_login_shell, Some(&self.children))?;
        conn.ok(None)?;
        Ok(())
    }

    /// Handles one message with the identity envelope: optional session
    /// and grandchild fork, become, handler, restore. The restore runs on
    /// every path before the next message is read.
    fn dispatch(&mut self, verb: Verb, message: &str, conn: &mut dyn Connector) -> Result<()> {
        if self.switch.switching() && !verb.skips_identity() {
            let Some(identity) = extract_parameter(message, "IDENTITY") else {
                conn.failed("No user/group info given")?;
                return Ok(());
            };
            let mut parts = identity.split_whitespace();
            let Some(user) = parts.next().map(str::to_string) else {
                conn.failed("No user/group info given")?;
                return Ok(());
            };
            let groups: Vec<&str> = parts.next().map(|g| g.split(':').collect()).unwrap_or_default();
            let groups = if groups.is_empty() { vec!["NONE"] } else { groups };

            if self.config.open_user_sessions && verb.wants_session() {
                return self.dispatch_in_session(verb, message, conn, &user, &groups);
            }

            let result = self
                .switch
                .become_user(&user, &groups, &mut self.cache, &self.config)
                .map_err(anyhow::Error::from)
                .and_then(|_| self.invoke(verb, message, conn));
            if let Err(e) = &result {
                conn.failed(&e.to_string())?;
                info!("error executing {verb:?}: {e:#}");
            }
            self.switch
                .restore()
                .context("could not restore privileged identity")?;
            return Ok(());
        }

        if let Err(e) = self.invoke(verb, message, conn) {
            conn.failed(&e.to_string())?;
            info!("error executing {verb:?}: {e:#}");
        }
        Ok(())
    }

    /// Session verbs run in a grandchild so the PAM session places only
    /// the launched work into the user's cgroup slice, not this worker.
    fn dispatch_in_session(
        &mut self,
        verb: Verb,
        message: &str,
        conn: &mut dyn Connector,
        user: &str,
        groups: &[&str],
    ) -> Result<()> {
        // SAFETY: the worker is single threaded
        match unsafe { fork()? } {
            ForkResult::Parent { child } => {
                match waitpid(child, None) {
                    Ok(_) | Err(nix::errno::Errno::ECHILD) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            ForkResult::Child => {
                self.pam.open_session(user);
                let result = self
                    .switch
                    .become_user(user, groups, &mut self.cache, &self.config)
                    .map_err(anyhow::Error::from)
                    .and_then(|_| self.invoke(verb, message, conn));
                if let Err(e) = &result {
                    let _ = conn.failed(&e.to_string());
                    info!("error executing {verb:?}: {e:#}");
                }
                if let Err(e) = self.switch.restore() {
                    warn!("could not restore privileged identity: {e}");
                }
                self.pam.close_session();
                unsafe { libc::_exit(0) }
            }
        }
    }
}

impl Worker {
    /// Reads messages until the peer closes, dispatching each one. With
    /// `one_shot` set, exactly one message is processed.
    fn run(&mut self, conn: &mut dyn Connector, one_shot: bool) -> Result<()> {
        let safe_dir = self.config.safe_dir.clone();
        loop {
            let message = match conn.read_message() {
                Ok(message) => message,
                Err(_) => {
                    info!("peer shutdown, exiting");
                    let _ = conn.close();
                    return Ok(());
                }
            };
            if let Err(e) = std::env::set_current_dir(&safe_dir) {
                warn!("cannot enter safe directory {}: {e}", safe_dir.display());
            }

            match Verb::find(&message) {
                Some(verb) => {
                    debug!("processing {verb:?}");
                    self.dispatch(verb, &message, conn)?;
                    self.children.reap_finished();
                }
                None => {
                    info!("unknown command");
                    conn.failed("Unknown command")?;
                }
            }

            conn.write_message(crate::connector::END_OF_MESSAGE)?;
            if one_shot {
                conn.close()?;
                return Ok(());
            }
        }
    }
}

/// Worker entry point.
pub fn process(conn: &mut dyn Connector, config: Config, one_shot: bool) -> Result<()> {
    Worker::new(config)?.run(conn, one_shot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::testing::MockConnector;

    fn test_worker() -> Worker {
        let config = Config::default();
        Worker {
            switch: UserSwitch::unswitched(HostOs),
            cache: UserCache::new(config.user_cache_ttl, false),
            bss: bss::select(&config.batch_variant).unwrap(),
            pam: PamSession::new(&config.pam_module),
            children: Children::default(),
            config,
        }
    }

    fn run_one(message: &str) -> MockConnector {
        let mut conn = MockConnector::default();
        conn.control_in.push(message.to_string());
        test_worker().run(&mut conn, true).unwrap();
        conn
    }

    #[test]
    fn ping_reports_the_version() {
        let conn = run_one("#TSI_PING\n");
        assert_eq!(conn.control_out, format!("{TSI_VERSION}\nENDOFMESSAGE\n"));
    }

    #[test]
    fn ping_uid_reports_the_effective_uid() {
        let conn = run_one("#TSI_PING_UID\n");
        assert!(conn.control_out.contains(" running as UID ["));
        assert!(conn.control_out.ends_with("ENDOFMESSAGE\n"));
    }

    #[test]
    fn execute_script_captures_output() {
        let conn = run_one("#TSI_EXECUTESCRIPT\necho \"Hello World!\"\n");
        assert_eq!(
            conn.control_out,
            "TSI_OK\nHello World!\n\nENDOFMESSAGE\n"
        );
    }

    #[test]
    fn execute_script_failures_are_reported_inline() {
        let conn = run_one("#TSI_EXECUTESCRIPT\nexit 7\n");
        assert!(conn.control_out.starts_with("TSI_FAILED: "), "{}", conn.control_out);
        assert!(conn.control_out.ends_with("ENDOFMESSAGE\n"));
        // the failure reason stays on a single line
        assert_eq!(conn.control_out.lines().count(), 2);
    }

    #[test]
    fn unknown_commands_fail_cleanly() {
        let conn = run_one("#TSI_MAKE_COFFEE\n");
        assert_eq!(conn.control_out, "TSI_FAILED: Unknown command\nENDOFMESSAGE\n");
    }

    #[test]
    fn reservation_verbs_report_unsupported() {
        let conn = run_one("#TSI_MAKE_RESERVATION\n");
        assert_eq!(
            conn.control_out,
            "TSI_FAILED: Reservation not supported!\nENDOFMESSAGE\n"
        );
    }

    #[test]
    fn every_reply_ends_with_one_terminator() {
        for msg in [
            "#TSI_PING\n",
            "#TSI_EXECUTESCRIPT\ntrue\n",
            "#TSI_GET_COMPUTE_BUDGET\n",
            "#TSI_NO_SUCH_VERB\n",
        ] {
            let conn = run_one(msg);
            let terminators = conn
                .control_out
                .lines()
                .filter(|l| *l == "ENDOFMESSAGE")
                .count();
            assert_eq!(terminators, 1, "{msg}: {}", conn.control_out);
        }
    }

    #[test]
    fn worker_exits_cleanly_on_peer_shutdown() {
        let mut conn = MockConnector::default();
        test_worker().run(&mut conn, false).unwrap();
        assert!(conn.control_out.is_empty());
        assert!(conn.closed);
    }

    #[test]
    fn one_shot_closes_the_channel() {
        let conn = run_one("#TSI_PING\n");
        assert!(conn.closed);
    }

    #[test]
    fn budget_reports_the_placeholder() {
        let conn = run_one("#TSI_GET_COMPUTE_BUDGET\n");
        assert_eq!(conn.control_out, "TSI_OK\nUSER -1\n\nENDOFMESSAGE\n");
    }
}
