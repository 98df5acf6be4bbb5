//! Batch system adaptors.
//!
//! One [`BatchSystem`] implementation exists per supported scheduler
//! (Slurm, Torque, LSF, LoadLeveler) plus the NOBATCH fallback that runs
//! jobs as local child processes. The variant is selected once at startup
//! from the `batch_variant` configuration key; the common submit and
//! listing machinery lives in provided trait methods and calls back into
//! the variant's script builder and parsers.

mod loadleveler;
mod lsf;
mod nobatch;
mod slurm;
mod torque;

pub use loadleveler::LoadLeveler;
pub use lsf::Lsf;
pub use nobatch::NoBatch;
pub use slurm::Slurm;
pub use torque::Torque;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use tracing::{debug, info};

use crate::config::Config;
use crate::connector::Connector;
use crate::msg::{
    add_perms, expand_variables, extract_parameter, parameter_or, run_and_report, run_command,
    run_detached, Children,
};
use crate::quota;

/// Job states reported to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Suspended,
    Completed,
    Unknown,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Suspended => "SUSPENDED",
            JobState::Completed => "COMPLETED",
            JobState::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

impl JobState {
    /// Position in the conflict-resolution order. When one job id shows up
    /// several times in a listing (array steps), the state with the
    /// highest position wins.
    fn precedence(self) -> i32 {
        match self {
            JobState::Completed => 0,
            JobState::Queued => 1,
            JobState::Suspended => 2,
            JobState::Running => 3,
            JobState::Unknown => -1,
        }
    }
}

/// Milliseconds since the epoch, used to build unique submission file
/// names.
fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Validates a requested job name. The first acceptable run of characters
/// is used; anything else falls back to a fixed name.
pub fn sanitize_job_name(requested: &str) -> String {
    let re = Regex::new(r"[a-zA-Z][\w.:=~/-]{0,14}").unwrap();
    match re.find(requested) {
        Some(m) => m.as_str().to_string(),
        None => "UNICORE_job".to_string(),
    }
}

/// Common per-submission parameters shared by the script builders.
pub(crate) struct SubmitParams<'a> {
    pub email: &'a str,
    pub job_name: String,
    pub outcome_dir: &'a str,
    pub project: &'a str,
    pub stdout: String,
    pub stderr: String,
    pub umask: Option<&'a str>,
    pub uspace_dir: &'a str,
    pub memory: i64,
    pub nodes: i64,
    pub processors_per_node: i64,
    pub total_processors: i64,
    pub array: i64,
    pub array_limit: i64,
    pub queue: &'a str,
    pub qos: &'a str,
    pub reservation: &'a str,
    pub time: i64,
    /// Site-wide node filter from the configuration.
    pub site_nodes_filter: String,
    /// Filter requested in the message, if any. How (and whether) it
    /// combines with the site filter is a per-variant convention.
    pub user_nodes_filter: Option<&'a str>,
    pub exclusive: bool,
    pub comment: Option<&'a str>,
    pub gpus_per_node: i64,
}

impl<'a> SubmitParams<'a> {
    pub fn parse(message: &'a str, config: &Config) -> Self {
        let user_nodes_filter = match parameter_or(message, "BSS_NODES_FILTER", "NONE") {
            "NONE" => None,
            filter => Some(filter),
        };
        Self {
            email: parameter_or(message, "EMAIL", "NONE"),
            job_name: sanitize_job_name(parameter_or(
                message,
                "JOBNAME",
                &config.default_job_name,
            )),
            outcome_dir: parameter_or(message, "OUTCOME_DIR", "."),
            project: parameter_or(message, "PROJECT", "NONE"),
            stdout: parameter_or(message, "STDOUT", "stdout").to_string(),
            stderr: parameter_or(message, "STDERR", "stderr").to_string(),
            umask: extract_parameter(message, "UMASK"),
            uspace_dir: parameter_or(message, "USPACE_DIR", "."),
            memory: crate::msg::extract_number(message, "MEMORY"),
            nodes: crate::msg::extract_number(message, "NODES"),
            processors_per_node: crate::msg::extract_number(message, "PROCESSORS_PER_NODE"),
            total_processors: crate::msg::extract_number(message, "TOTAL_PROCESSORS"),
            array: crate::msg::extract_number(message, "ARRAY"),
            array_limit: crate::msg::extract_number(message, "ARRAY_LIMIT"),
            queue: parameter_or(message, "QUEUE", "NONE"),
            qos: parameter_or(message, "QOS", "NONE"),
            reservation: parameter_or(message, "RESERVATION_REFERENCE", "NONE"),
            time: crate::msg::extract_number(message, "TIME"),
            site_nodes_filter: config.nodes_filter.clone(),
            user_nodes_filter,
            exclusive: parameter_or(message, "SSR_EXCLUSIVE", "false") == "true",
            comment: extract_parameter(message, "SSR_COMMENT"),
            gpus_per_node: crate::msg::extract_number(message, "GPUS_PER_NODE"),
        }
    }
}

pub trait BatchSystem {
    fn variant(&self) -> &'static str;

    /// Default command lines merged into the settings map at startup when
    /// the configuration does not set them.
    fn defaults(&self) -> Vec<(&'static str, &'static str)> {
        Vec::new()
    }

    /// Builds the scheduler directives for a normal submission (shebang
    /// plus directive lines; the user script file is appended by
    /// `submit`).
    fn create_submit_script(&self, _message: &str, _config: &Config) -> Vec<String> {
        Vec::new()
    }

    /// Builds the shell lines for an allocation-only submission.
    fn create_alloc_script(&self, _message: &str, _config: &Config) -> Result<Vec<String>> {
        bail!("Allocation mode not supported for {}", self.variant())
    }

    /// Regular expression extracting the job id from the submission
    /// command's reply.
    fn job_id_expr(&self) -> &'static str {
        r"\D*(\d+)\D*"
    }

    fn extract_job_id(&self, submit_result: &str) -> Option<String> {
        let re = Regex::new(self.job_id_expr()).unwrap();
        re.captures(submit_result)
            .map(|caps| caps.get(1).unwrap().as_str().to_string())
    }

    /// Splits one raw listing line into (job id, raw state, queue name).
    /// Lines that carry no job information return None.
    fn extract_info(&self, qstat_line: &str) -> Option<(String, String, String)>;

    /// Maps a scheduler-specific state string to the normalized set.
    fn convert_status(&self, bss_state: &str) -> JobState;

    /// Fills in default commands for anything the configuration does not
    /// set. Called once at startup.
    fn init(&self, config: &mut Config) -> Result<()> {
        apply_defaults(self.defaults(), config);
        Ok(())
    }

    /// Startup check that the configured status command actually runs.
    fn verify_commands(&self, config: &Config) -> Result<()> {
        let qstat_cmd = config.command("qstat_cmd")?;
        run_command(qstat_cmd, config.use_login_shell).map_err(|e| {
            anyhow!(
                "could not run command to check job statuses, \
                 please check the configuration of 'qstat_cmd': {e}"
            )
        })?;
        Ok(())
    }

    /// Submits a job. The job mode chooses how the scheduler input is
    /// produced: "normal" builds directives from the message parameters,
    /// "raw" submits the file named by TSI_JOB_FILE untouched, and
    /// "allocate" starts the allocation command in the background and
    /// reports OK immediately (the orchestrator picks the allocation id up
    /// from a file later).
    fn submit(
        &self,
        message: &str,
        connector: &mut dyn Connector,
        config: &Config,
        children: &Children,
    ) -> Result<()> {
        let message = expand_variables(message);
        let uspace_dir = extract_parameter(&message, "USPACE_DIR")
            .ok_or_else(|| anyhow!("missing TSI_USPACE_DIR"))?;
        std::env::set_current_dir(uspace_dir)
            .with_context(|| format!("cannot enter job directory {uspace_dir}"))?;

        let job_mode = parameter_or(&message, "JOB_MODE", "normal");
        let is_alloc = job_mode.starts_with("alloc");
        debug!("submitting a batch job, mode={job_mode}");

        let submit_cmds = if job_mode == "normal" {
            self.create_submit_script(&message, config)
        } else if job_mode == "raw" {
            let file = extract_parameter(&message, "JOB_FILE")
                .ok_or_else(|| anyhow!("Job mode 'raw' requires TSI_JOB_FILE"))?;
            vec![std::fs::read_to_string(file)
                .with_context(|| format!("cannot read job file {file}"))?]
        } else if is_alloc {
            self.create_alloc_script(&message, config)?
        } else {
            bail!("Illegal job mode: {job_mode}");
        };

        let submit_id = now_millis();
        let userjob_file = format!("UNICORE_Job_{submit_id}");

        if is_alloc {
            let pid_file = parameter_or(&message, "PID_FILE", "UNICORE_SCRIPT_PID");
            let mut cmd = format!("{message}\n{{ ");
            for line in &submit_cmds {
                cmd.push_str(line);
                cmd.push_str(" ; ");
            }
            cmd.push_str(&format!("}} & echo $! > {pid_file} \n"));
            std::fs::write(&userjob_file, &cmd)
                .with_context(|| format!("cannot write {userjob_file}"))?;
            run_detached(&cmd, config.use_login_shell, Some(children))?;
            connector.ok(None)?;
            return Ok(());
        }

        std::fs::write(&userjob_file, &message)
            .with_context(|| format!("cannot write {userjob_file}"))?;
        add_perms(&userjob_file, 0o770)?;

        let mut submit_cmds = submit_cmds;
        submit_cmds.push(format!("{uspace_dir}/{userjob_file}"));
        let submit_file = format!("bss_submit_{submit_id}");
        std::fs::write(&submit_file, submit_cmds.join("\n") + "\n")
            .with_context(|| format!("cannot write {submit_file}"))?;
        add_perms(&submit_file, 0o770)?;

        let cmd = format!("{} ./{}", config.command("submit_cmd")?, submit_file);
        let reply = run_command(&cmd, config.use_login_shell)?;
        info!("job submission result: {reply}");
        match self.extract_job_id(&reply) {
            Some(job_id) => connector.write_message(&job_id)?,
            None => bail!("Submit failed? Submission result: {reply}"),
        }
        Ok(())
    }

    /// Parses a raw status listing into the reply format:
    /// `QSTAT` then one ` <id> <STATE> <queue>` line per job.
    fn parse_status_listing(&self, qstat_result: &str) -> String {
        let mut order: Vec<String> = Vec::new();
        let mut states: std::collections::HashMap<String, (JobState, String)> =
            std::collections::HashMap::new();
        for line in qstat_result.lines() {
            let Some((bssid, state, queue)) = self.extract_info(line) else {
                continue;
            };
            let ustate = self.convert_status(&state);
            let replace = match states.get(&bssid) {
                None => {
                    order.push(bssid.clone());
                    true
                }
                Some((have, _)) => ustate.precedence() > have.precedence(),
            };
            if replace {
                states.insert(bssid, (ustate, queue));
            }
        }
        let mut result = String::from("QSTAT\n");
        for bssid in order {
            let (state, queue) = &states[&bssid];
            result.push_str(&format!(" {bssid} {state} {queue}\n"));
        }
        result
    }

    fn get_status_listing(&self, connector: &mut dyn Connector, config: &Config) -> Result<()> {
        let qstat_cmd = config.command("qstat_cmd")?;
        let output = run_command(qstat_cmd, config.use_login_shell)?;
        connector.write_message(&self.parse_status_listing(&output))?;
        Ok(())
    }

    fn get_job_details(
        &self,
        message: &str,
        connector: &mut dyn Connector,
        config: &Config,
    ) -> Result<()> {
        let bssid =
            extract_parameter(message, "BSSID").ok_or_else(|| anyhow!("missing TSI_BSSID"))?;
        let cmd = format!("{} {bssid}", config.command("details_cmd")?);
        let output = run_command(&cmd, config.use_login_shell)?;
        let details = parse_job_details(&output);
        connector.ok(Some(&format!("{details}\n")))?;
        Ok(())
    }

    fn abort_job(
        &self,
        message: &str,
        connector: &mut dyn Connector,
        config: &Config,
    ) -> Result<()> {
        let bssid =
            extract_parameter(message, "BSSID").ok_or_else(|| anyhow!("missing TSI_BSSID"))?;
        let template = config.command("abort_cmd")?;
        let cmd = if template.contains("%s") {
            template.replace("%s", bssid)
        } else {
            format!("{template} {bssid}")
        };
        run_and_report(&cmd, connector, config.use_login_shell)
    }

    fn hold_job(
        &self,
        message: &str,
        connector: &mut dyn Connector,
        config: &Config,
    ) -> Result<()> {
        let bssid =
            extract_parameter(message, "BSSID").ok_or_else(|| anyhow!("missing TSI_BSSID"))?;
        let cmd = format!("{} {bssid}", config.command("hold_cmd")?);
        run_and_report(&cmd, connector, config.use_login_shell)
    }

    fn resume_job(
        &self,
        message: &str,
        connector: &mut dyn Connector,
        config: &Config,
    ) -> Result<()> {
        let bssid =
            extract_parameter(message, "BSSID").ok_or_else(|| anyhow!("missing TSI_BSSID"))?;
        let cmd = format!("{} {bssid}", config.command("resume_cmd")?);
        run_and_report(&cmd, connector, config.use_login_shell)
    }

    /// Remaining compute budget of the current user. The default reports
    /// the site hook's placeholder.
    fn get_budget(&self, connector: &mut dyn Connector, config: &Config) -> Result<()> {
        let budget = quota::get_quota(config);
        connector.ok(Some(&format!("{budget}\n")))?;
        Ok(())
    }

    fn get_process_listing(
        &self,
        message: &str,
        connector: &mut dyn Connector,
        config: &Config,
    ) -> Result<()> {
        let default = config.command("get_processes_cmd")?;
        let cmd = parameter_or(message, "PS", default);
        run_and_report(cmd, connector, config.use_login_shell)
    }

    /// Partition information, supported only where the scheduler has the
    /// concept.
    fn get_partitions(&self, _connector: &mut dyn Connector, _config: &Config) -> Result<()> {
        bail!("Querying partitions is not supported for {}", self.variant())
    }
}

/// Merges the variant's default command lines over the base defaults and
/// stores whatever the configuration leaves unset.
pub(crate) fn apply_defaults(variant_defaults: Vec<(&'static str, &'static str)>, config: &mut Config) {
    let mut defaults: Vec<(&str, &str)> = vec![
        ("qstat_cmd", "ps -e -os,args"),
        (
            "abort_cmd",
            r#"SID=$(ps -e -osid,args | grep "nice .* ./UNICORE_Job_%s" | grep -v "grep " | egrep -o "^\s*([0-9]+)" ); pkill -SIGTERM -s $SID"#,
        ),
        ("get_processes_cmd", "ps -e"),
    ];
    for (key, value) in variant_defaults {
        match defaults.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => defaults.push((key, value)),
        }
    }
    for (key, value) in defaults {
        if config.setting(key).is_none() {
            info!("using default: '{key}' = '{value}'");
            config.set_setting(key, value);
        }
    }
}

/// Converts whitespace-separated `key=value` job details into a JSON
/// object; anything unparseable is passed through raw.
pub fn parse_job_details(raw: &str) -> String {
    let mut map = serde_json::Map::new();
    for token in raw.split_whitespace() {
        if let Some((k, v)) = token.split_once('=') {
            map.insert(k.to_string(), serde_json::Value::String(v.to_string()));
        }
    }
    if map.is_empty() {
        let mut fallback = serde_json::Map::new();
        fallback.insert(
            "errorMessage".to_string(),
            serde_json::Value::String("Could not parse BSS job details".to_string()),
        );
        fallback.insert(
            "BSSJobDetails".to_string(),
            serde_json::Value::String(raw.to_string()),
        );
        return serde_json::Value::Object(fallback).to_string();
    }
    serde_json::Value::Object(map).to_string()
}

/// Selects the batch adaptor configured for this site.
pub fn select(variant: &str) -> Result<Box<dyn BatchSystem>> {
    match variant.to_ascii_lowercase().as_str() {
        "nobatch" | "none" => Ok(Box::new(NoBatch)),
        "slurm" => Ok(Box::new(Slurm)),
        "torque" => Ok(Box::new(Torque)),
        "lsf" => Ok(Box::new(Lsf)),
        "loadleveler" => Ok(Box::new(LoadLeveler)),
        other => bail!("unknown batch system variant '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fake;

    impl BatchSystem for Fake {
        fn variant(&self) -> &'static str {
            "fake"
        }
        fn extract_info(&self, line: &str) -> Option<(String, String, String)> {
            let mut parts = line.split_whitespace();
            Some((
                parts.next()?.to_string(),
                parts.next()?.to_string(),
                parts.next()?.to_string(),
            ))
        }
        fn convert_status(&self, state: &str) -> JobState {
            match state {
                "Q" => JobState::Queued,
                "R" => JobState::Running,
                "S" => JobState::Suspended,
                "C" => JobState::Completed,
                _ => JobState::Unknown,
            }
        }
    }

    #[test]
    fn default_job_id_extraction() {
        let bss = Fake;
        assert_eq!(bss.extract_job_id("job 4711 queued"), Some("4711".into()));
        assert_eq!(bss.extract_job_id("nothing here"), None);
    }

    #[test]
    fn listing_preserves_order_and_resolves_conflicts() {
        let bss = Fake;
        let listing = "10 R large\n11 Q small\n10 C large\n11 S small\n";
        let result = bss.parse_status_listing(listing);
        // running outranks completed, suspended outranks queued
        assert_eq!(result, "QSTAT\n 10 RUNNING large\n 11 SUSPENDED small\n");
    }

    #[test]
    fn unknown_never_wins_conflicts() {
        let bss = Fake;
        let listing = "10 Q large\n10 X large\n";
        let result = bss.parse_status_listing(listing);
        assert_eq!(result, "QSTAT\n 10 QUEUED large\n");
    }

    #[test]
    fn job_name_sanitizing() {
        assert_eq!(sanitize_job_name("test_job"), "test_job");
        assert_eq!(sanitize_job_name("my/job.1"), "my/job.1");
        assert_eq!(sanitize_job_name("...%%%"), "UNICORE_job");
        // over-long names are clipped to the acceptable run
        assert_eq!(
            sanitize_job_name("abcdefghijklmnopqrstuvwxyz"),
            "abcdefghijklmno"
        );
    }

    #[test]
    fn job_details_to_json() {
        let parsed = parse_job_details("JobId=123 JobState=RUNNING Partition=large");
        let v: serde_json::Value = serde_json::from_str(&parsed).unwrap();
        assert_eq!(v["JobId"], "123");
        assert_eq!(v["JobState"], "RUNNING");
    }

    #[test]
    fn unparseable_details_are_passed_through() {
        let parsed = parse_job_details("nothing useful");
        let v: serde_json::Value = serde_json::from_str(&parsed).unwrap();
        assert_eq!(v["BSSJobDetails"], "nothing useful");
    }

    #[test]
    fn variant_selection() {
        assert_eq!(select("slurm").unwrap().variant(), "Slurm");
        assert_eq!(select("NOBATCH").unwrap().variant(), "NOBATCH");
        assert!(select("pbspro").is_err());
    }
}
