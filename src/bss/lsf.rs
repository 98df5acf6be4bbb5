//! LSF adaptor. The submission command reads the script from stdin, so
//! `init` makes sure the configured command ends with `<`.

use anyhow::Result;
use regex::Regex;

use super::{BatchSystem, JobState, SubmitParams};
use crate::config::Config;

pub struct Lsf;

impl BatchSystem for Lsf {
    fn variant(&self) -> &'static str {
        "LSF"
    }

    fn defaults(&self) -> Vec<(&'static str, &'static str)> {
        vec![
            ("submit_cmd", "bsub <"),
            ("qstat_cmd", "bjobs -w -u all"),
            ("details_cmd", "bjobs -l"),
            ("abort_cmd", "bkill %s"),
            ("hold_cmd", "bstop"),
            ("resume_cmd", "bresume"),
        ]
    }

    fn init(&self, config: &mut Config) -> Result<()> {
        super::apply_defaults(self.defaults(), config);
        // the submission command must read the script from stdin
        let submit_cmd = config.command("submit_cmd")?.to_string();
        if !submit_cmd.trim_end().ends_with('<') {
            config.set_setting("submit_cmd", &format!("{submit_cmd} <"));
        }
        Ok(())
    }

    fn create_submit_script(&self, message: &str, config: &Config) -> Vec<String> {
        let mut params = SubmitParams::parse(message, config);
        let mut cmds = Vec::new();

        if params.email != "NONE" {
            cmds.push(format!("#BSUB -B -N -u {}", params.email));
        }
        if params.queue != "NONE" {
            cmds.push(format!("#BSUB -q {}", params.queue));
        }
        if params.project != "NONE" {
            cmds.push(format!("#BSUB -P {}", params.project));
        }

        // slots: either the total or nodes times processors per node
        let mut slots = 0;
        if params.total_processors > 0 {
            slots = params.total_processors;
        } else if params.nodes > 0 && params.processors_per_node > 0 {
            slots = params.nodes * params.processors_per_node;
            cmds.push(format!(
                "#BSUB -R \"span[ptile={}]\"",
                params.processors_per_node
            ));
        }
        if slots > 0 {
            cmds.push(format!("#BSUB -n {slots}"));
        }
        if params.gpus_per_node > 0 {
            cmds.push(format!(
                "#BSUB -gpu \"num={}:j_exclusive=yes\"",
                params.gpus_per_node
            ));
        }
        if params.time > 0 {
            // wall clock time in minutes
            cmds.push(format!("#BSUB -W {}", params.time / 60));
        }
        if params.reservation != "NONE" {
            cmds.push(format!("#BSUB -U {}", params.reservation));
        }
        if params.array > 0 {
            let spec = if params.array_limit > 0 {
                format!("[{}]%{}", params.array, params.array_limit)
            } else {
                format!("[{}]", params.array)
            };
            cmds.push(format!("#BSUB -J \"{}{spec}\"", params.job_name));
            cmds.push("UC_ARRAY_TASK_ID=\"$LSB_JOB_INDEX\"; export UC_ARRAY_TASK_ID".to_string());
            params.stdout.push_str("%I");
            params.stderr.push_str("%I");
        } else {
            cmds.push(format!("#BSUB -J {}", params.job_name));
        }
        cmds.push(format!("#BSUB -o {}/{}", params.outcome_dir, params.stdout));
        cmds.push(format!("#BSUB -e {}/{}", params.outcome_dir, params.stderr));
        if let Some(umask) = params.umask {
            cmds.push(format!("umask {umask}"));
        }
        cmds
    }

    fn extract_info(&self, qstat_line: &str) -> Option<(String, String, String)> {
        // rows look like `1652 bob DONE normal gridnode1 ...`; anything not
        // starting with a numeric id is decoration
        let re = Regex::new(r"^\s*(\d+)\s+\S+\s+(\w+)\s+(\w+)").unwrap();
        let caps = re.captures(qstat_line)?;
        Some((
            caps.get(1).unwrap().as_str().to_string(),
            caps.get(2).unwrap().as_str().to_string(),
            caps.get(3).unwrap().as_str().to_string(),
        ))
    }

    fn convert_status(&self, bss_state: &str) -> JobState {
        match bss_state {
            "PEND" | "WAIT" | "ZOMBI" => JobState::Queued,
            "RUN" | "POST_DONE" | "POST_ERR" => JobState::Running,
            "PSUSP" | "USUSP" | "SSUSP" => JobState::Suspended,
            "DONE" | "EXIT" => JobState::Completed,
            _ => JobState::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_cmd_gets_stdin_redirect() {
        let mut cfg = Config::default();
        cfg.set_setting("submit_cmd", "bsub -env all");
        Lsf.init(&mut cfg).unwrap();
        assert_eq!(cfg.setting("submit_cmd"), Some("bsub -env all <"));
        // already redirected commands stay unchanged
        Lsf.init(&mut cfg).unwrap();
        assert_eq!(cfg.setting("submit_cmd"), Some("bsub -env all <"));
    }

    #[test]
    fn slots_from_nodes_and_ppn() {
        let msg = "#TSI_SUBMIT\n#TSI_USPACE_DIR /work\n#TSI_NODES 2\n\
                   #TSI_PROCESSORS_PER_NODE 16\n";
        let cmds = Lsf.create_submit_script(msg, &Config::default());
        assert!(cmds.contains(&"#BSUB -R \"span[ptile=16]\"".to_string()));
        assert!(cmds.contains(&"#BSUB -n 32".to_string()));
    }

    #[test]
    fn time_is_converted_to_minutes() {
        let msg = "#TSI_SUBMIT\n#TSI_USPACE_DIR /work\n#TSI_TIME 600\n";
        let cmds = Lsf.create_submit_script(msg, &Config::default());
        assert!(cmds.contains(&"#BSUB -W 10".to_string()));
    }

    #[test]
    fn bjobs_rows_parse() {
        let line = "1652  bob  DONE normal gridnode1  gridnode3   date Jun 19 12:45";
        assert_eq!(
            Lsf.extract_info(line),
            Some(("1652".into(), "DONE".into(), "normal".into()))
        );
        assert!(Lsf
            .extract_info("JOBID USER STAT QUEUE FROM_HOST")
            .is_none());
    }

    #[test]
    fn state_conversion() {
        assert_eq!(Lsf.convert_status("PEND"), JobState::Queued);
        assert_eq!(Lsf.convert_status("RUN"), JobState::Running);
        assert_eq!(Lsf.convert_status("USUSP"), JobState::Suspended);
        assert_eq!(Lsf.convert_status("DONE"), JobState::Completed);
        assert_eq!(Lsf.convert_status("GONE"), JobState::Unknown);
    }
}
