//! NOBATCH adaptor: no scheduler, jobs run as local child processes under
//! nice/ionice with optional wall-time and memory limits. The "job id" is
//! the worker pid plus a timestamp tail, which makes the job findable in
//! the `ps` output later.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use tracing::debug;

use super::{now_millis, BatchSystem, JobState};
use crate::config::Config;
use crate::connector::Connector;
use crate::msg::{add_perms, expand_variables, extract_number, parameter_or, run_detached, Children};

pub struct NoBatch;

impl BatchSystem for NoBatch {
    fn variant(&self) -> &'static str {
        "NOBATCH"
    }

    fn submit(
        &self,
        message: &str,
        connector: &mut dyn Connector,
        config: &Config,
        children: &Children,
    ) -> Result<()> {
        children.reap_finished();
        debug!("submitting a script");
        let message = expand_variables(message);

        let outcome_dir = parameter_or(&message, "OUTCOME_DIR", ".").to_string();
        let uspace_dir = parameter_or(&message, "USPACE_DIR", ".");
        let stdout = parameter_or(&message, "STDOUT", "stdout");
        let stderr = parameter_or(&message, "STDERR", "stderr");
        let req_time = extract_number(&message, "TIME");
        let memory = extract_number(&message, "MEMORY");

        let mut ulimits = String::new();
        let mut timeout_cmd = String::new();
        if req_time > 0 {
            // limit wall time, with a small kill grace period
            let grace = (req_time as f64 * 0.01) as i64;
            timeout_cmd = format!("timeout -k {grace} {req_time}");
        }
        if memory > 0 {
            // limit virtual memory, MB to KB
            ulimits = format!("ulimit -v {};", 1024 * memory);
        }

        // lighten the footprint on the front end node
        let nice = 100;
        let ionice = "ionice -c 3";

        std::env::set_current_dir(uspace_dir)
            .with_context(|| format!("cannot enter job directory {uspace_dir}"))?;
        if !std::path::Path::new(&outcome_dir).exists() {
            std::fs::create_dir(&outcome_dir)
                .with_context(|| format!("cannot create {outcome_dir}"))?;
        }
        add_perms(&outcome_dir, 0o700)?;

        // unique id that stays visible in the ps output
        let millis = now_millis().to_string();
        let tail = if millis.len() > 5 { &millis[5..] } else { &millis };
        let job_id = format!("{}{}", std::process::id(), tail);
        let cmds_file = format!("UNICORE_Job_{job_id}");
        std::fs::write(&cmds_file, &message).with_context(|| format!("cannot write {cmds_file}"))?;
        add_perms(&cmds_file, 0o700)?;

        let cmd = format!(
            "{ulimits} {ionice} nice -n {nice} {timeout_cmd} ./{cmds_file} \
             > {outcome_dir}/{stdout} 2> {outcome_dir}/{stderr}"
        );
        run_detached(&cmd, config.use_login_shell, Some(children))?;
        connector.write_message(&job_id)?;
        Ok(())
    }

    fn extract_info(&self, qstat_line: &str) -> Option<(String, String, String)> {
        let re = Regex::new(r"(\w) .*UNICORE_Job_(\d+)").unwrap();
        let caps = re.captures(qstat_line)?;
        Some((
            caps.get(2).unwrap().as_str().to_string(),
            caps.get(1).unwrap().as_str().to_string(),
            "NOBATCH".to_string(),
        ))
    }

    fn convert_status(&self, bss_state: &str) -> JobState {
        if bss_state == "T" {
            JobState::Suspended
        } else {
            JobState::Running
        }
    }

    fn get_job_details(
        &self,
        message: &str,
        connector: &mut dyn Connector,
        _config: &Config,
    ) -> Result<()> {
        // nothing to report without a batch system
        let bssid = crate::msg::extract_parameter(message, "BSSID")
            .ok_or_else(|| anyhow!("missing TSI_BSSID"))?;
        connector.ok(Some(&format!("No info available for job {bssid} \n")))?;
        Ok(())
    }

    fn hold_job(
        &self,
        _message: &str,
        connector: &mut dyn Connector,
        _config: &Config,
    ) -> Result<()> {
        connector.ok(Some("\n"))?;
        Ok(())
    }

    fn resume_job(
        &self,
        _message: &str,
        connector: &mut dyn Connector,
        _config: &Config,
    ) -> Result<()> {
        connector.ok(Some("\n"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::testing::MockConnector;

    #[test]
    fn ps_lines_map_to_jobs() {
        let bss = NoBatch;
        assert_eq!(
            bss.extract_info("S    nice -n 100  ./UNICORE_Job_123456 "),
            Some(("123456".into(), "S".into(), "NOBATCH".into()))
        );
        assert_eq!(bss.extract_info("S    /usr/bin/something"), None);
    }

    #[test]
    fn stopped_processes_count_as_suspended() {
        let bss = NoBatch;
        assert_eq!(bss.convert_status("T"), JobState::Suspended);
        assert_eq!(bss.convert_status("S"), JobState::Running);
        assert_eq!(bss.convert_status("R"), JobState::Running);
    }

    #[test]
    fn listing_of_running_jobs() {
        let bss = NoBatch;
        let listing = "S  ionice -c 3 nice -n 100 ./UNICORE_Job_4711 \n\
                       T  ionice -c 3 nice -n 100 ./UNICORE_Job_4712 \n\
                       S  bash\n";
        let result = bss.parse_status_listing(listing);
        assert_eq!(
            result,
            "QSTAT\n 4711 RUNNING NOBATCH\n 4712 SUSPENDED NOBATCH\n"
        );
    }

    #[test]
    fn submit_runs_script_detached() {
        let dir = tempfile::tempdir().unwrap();
        let uspace = dir.path().to_str().unwrap();
        let msg = format!(
            "#TSI_SUBMIT\n#TSI_OUTCOME_DIR {uspace}/out\n#TSI_USPACE_DIR {uspace}\n\
             #TSI_STDOUT stdout\n#TSI_STDERR stderr\n#TSI_SCRIPT\necho hello\n"
        );
        let mut conn = MockConnector::default();
        let children = Children::default();
        NoBatch
            .submit(&msg, &mut conn, &Config::default(), &children)
            .unwrap();
        // reply is the job id on its own line
        let id = conn.control_out.trim();
        assert!(id.chars().all(|c| c.is_ascii_digit()), "{id}");
        assert!(dir.path().join("out").is_dir());
    }

    #[test]
    fn get_job_details_reports_placeholder() {
        let mut conn = MockConnector::default();
        NoBatch
            .get_job_details("#TSI_BSSID 4711\n", &mut conn, &Config::default())
            .unwrap();
        assert!(conn.control_out.contains("No info available for job 4711"));
    }
}
