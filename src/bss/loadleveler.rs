//! LoadLeveler adaptor, set up for Blue Gene class machines.

use regex::Regex;

use super::{BatchSystem, JobState, SubmitParams};
use crate::config::Config;
use crate::msg::parameter_or;

pub struct LoadLeveler;

impl BatchSystem for LoadLeveler {
    fn variant(&self) -> &'static str {
        "LoadLeveler"
    }

    fn defaults(&self) -> Vec<(&'static str, &'static str)> {
        vec![
            ("submit_cmd", "llsubmit"),
            ("qstat_cmd", "llq -r %id %st %c"),
            ("details_cmd", "llq -x -j"),
            ("abort_cmd", "llcancel %s"),
            ("hold_cmd", "llhold"),
            ("resume_cmd", "llhold -r"),
        ]
    }

    fn create_submit_script(&self, message: &str, config: &Config) -> Vec<String> {
        let params = SubmitParams::parse(message, config);
        let topology = parameter_or(message, "SSR_TOPOLOGY", "Either");
        let mut cmds = vec!["#!/bin/sh".to_string()];

        cmds.push(format!("# @ job_name = {}", params.job_name));
        if params.queue != "NONE" {
            cmds.push(format!("# @ class = {}", params.queue));
        }
        if params.project != "NONE" {
            cmds.push(format!("# @ account_no = {}", params.project));
        }
        cmds.push("# @ job_type = bluegene".to_string());
        cmds.push(format!("# @ bg_connectivity = {topology}"));
        if params.memory > 0 {
            cmds.push(format!("# @ bg_requirements = (Memory>= {})", params.memory));
        }
        if params.nodes > 0 {
            cmds.push(format!("# @ bg_size = {}", params.nodes));
        }
        // wall clock limit in seconds
        cmds.push(format!("# @ cpu_limit = {}", params.time));
        if params.email != "NONE" {
            cmds.push("# @ notification = always".to_string());
            cmds.push(format!("# @ notify_user = {}", params.email));
        }
        if params.reservation != "NONE" {
            cmds.push(format!("# @ ll_res_id = {}", params.reservation));
        }
        cmds.push(format!(
            "# @ output = {}/{}",
            params.outcome_dir, params.stdout
        ));
        cmds.push(format!(
            "# @ error = {}/{}",
            params.outcome_dir, params.stderr
        ));
        if let Some(umask) = params.umask {
            cmds.push(format!("umask {umask}"));
        }
        cmds.push("# @ comment = UNICORE".to_string());
        cmds
    }

    fn extract_job_id(&self, submit_result: &str) -> Option<String> {
        // `llsubmit: The job "cluster.host.162588" has been submitted.`
        let re = Regex::new(r"\D*\.(\d+)\D*").unwrap();
        re.captures(submit_result)
            .map(|caps| caps.get(1).unwrap().as_str().to_string())
    }

    fn extract_info(&self, qstat_line: &str) -> Option<(String, String, String)> {
        // `node1c1.host.eu.267412.10!R!m001`: job id without the trailing
        // step number, then state and class
        let re = Regex::new(r"\S+\.(\d+)\.\d+!(\S+)!(\S+)").unwrap();
        let caps = re.captures(qstat_line)?;
        Some((
            caps.get(1).unwrap().as_str().to_string(),
            caps.get(2).unwrap().as_str().to_string(),
            caps.get(3).unwrap().as_str().to_string(),
        ))
    }

    fn convert_status(&self, bss_state: &str) -> JobState {
        match bss_state {
            "I" | "D" | "P" | "XP" | "NQ" => JobState::Queued,
            "R" | "E" | "EP" | "T" | "V" | "VP" | "MP" | "ST" | "SX" | "CP" | "CK" => {
                JobState::Running
            }
            "S" | "H" | "HS" => JobState::Suspended,
            "C" | "RM" | "CA" | "X" | "TX" | "NR" => JobState::Completed,
            _ => JobState::Unknown,
        }
    }
}
