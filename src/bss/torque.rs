//! Torque / PBS adaptor.

use regex::Regex;

use super::{BatchSystem, JobState, SubmitParams};
use crate::config::Config;

pub struct Torque;

impl BatchSystem for Torque {
    fn variant(&self) -> &'static str {
        "Torque"
    }

    fn defaults(&self) -> Vec<(&'static str, &'static str)> {
        vec![
            ("submit_cmd", "qsub"),
            ("qstat_cmd", "qstat -a"),
            ("details_cmd", "qstat -f"),
            ("abort_cmd", "qdel %s"),
            ("hold_cmd", "qhold"),
            ("resume_cmd", "qrls"),
        ]
    }

    fn create_submit_script(&self, message: &str, config: &Config) -> Vec<String> {
        let mut params = SubmitParams::parse(message, config);
        let mut cmds = Vec::new();

        cmds.push(format!("#PBS -N {}", params.job_name));
        if params.queue != "NONE" {
            cmds.push(format!("#PBS -q {}", params.queue));
        }
        if params.project != "NONE" {
            cmds.push(format!("#PBS -A {}", params.project));
        }
        if params.nodes > 0 {
            // node properties are :-separated; a user filter only applies
            // on top of a configured site filter
            let mut filter = String::new();
            if !params.site_nodes_filter.is_empty() {
                filter = format!(":{}", params.site_nodes_filter);
                if let Some(user_filter) = params.user_nodes_filter {
                    filter.push(':');
                    filter.push_str(user_filter);
                }
            }
            cmds.push(format!(
                "#PBS -l nodes={}:ppn={}{}",
                params.nodes, params.processors_per_node, filter
            ));
        }
        if params.time > 0 {
            // wall clock limit in seconds
            cmds.push(format!("#PBS -l walltime={}", params.time));
        }
        if params.email == "NONE" {
            cmds.push("#PBS -m n".to_string());
        } else {
            cmds.push(format!("#PBS -m abe -M {}", params.email));
        }
        if params.reservation != "NONE" {
            cmds.push(format!("#PBS -W x=FLAGS:ADVRES:{}", params.reservation));
        }
        if params.array > 0 {
            let spec = if params.array_limit > 0 {
                format!("{}%{}", params.array, params.array_limit)
            } else {
                params.array.to_string()
            };
            cmds.push(format!("#PBS -t {spec}"));
            cmds.push("UC_ARRAY_TASK_ID=\"$PBS_ARRAYID\"; export UC_ARRAY_TASK_ID".to_string());
            params.stdout.push_str("$PBS_ARRAYID");
            params.stderr.push_str("$PBS_ARRAYID");
        }
        cmds.push(format!("#PBS -o {}/{}", params.outcome_dir, params.stdout));
        cmds.push(format!("#PBS -e {}/{}", params.outcome_dir, params.stderr));
        cmds.push(format!("#PBS -d {}", params.uspace_dir));
        if let Some(umask) = params.umask {
            cmds.push(format!("#PBS -W umask={umask}"));
        }
        cmds
    }

    fn extract_info(&self, qstat_line: &str) -> Option<(String, String, String)> {
        // typical `qstat -a` row:
        // 1234.host  jdoe  batch  New_Script  16522  1  --  1000mb 00:00 R 00:00
        let re = Regex::new(
            r"\s*(\d+)\.\S+\s+\S+\s+(\S+)\s+\S+\s+\S+\s+\S+\s+\S+\s+\S+\s+\S+\s+([CEHQRTWS]+)\s+\S+",
        )
        .unwrap();
        let caps = re.captures(qstat_line)?;
        Some((
            caps.get(1).unwrap().as_str().to_string(),
            caps.get(3).unwrap().as_str().to_string(),
            caps.get(2).unwrap().as_str().to_string(),
        ))
    }

    fn convert_status(&self, bss_state: &str) -> JobState {
        match bss_state {
            "Q" | "T" | "W" => JobState::Queued,
            "E" | "R" => JobState::Running,
            "S" | "H" => JobState::Suspended,
            "C" => JobState::Completed,
            _ => JobState::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSG: &str = "#TSI_SUBMIT\n#TSI_OUTCOME_DIR /work/out\n#TSI_USPACE_DIR /work\n\
#TSI_QUEUE batch\n#TSI_PROJECT proj\n#TSI_TIME 120\n#TSI_NODES 2\n\
#TSI_PROCESSORS_PER_NODE 8\n#TSI_JOBNAME myjob\n";

    #[test]
    fn submit_script_directives() {
        let cmds = Torque.create_submit_script(MSG, &Config::default());
        assert!(cmds.contains(&"#PBS -N myjob".to_string()));
        assert!(cmds.contains(&"#PBS -q batch".to_string()));
        assert!(cmds.contains(&"#PBS -A proj".to_string()));
        assert!(cmds.contains(&"#PBS -l nodes=2:ppn=8".to_string()));
        // wall time stays in seconds
        assert!(cmds.contains(&"#PBS -l walltime=120".to_string()));
        assert!(cmds.contains(&"#PBS -m n".to_string()));
        assert!(cmds.contains(&"#PBS -d /work".to_string()));
    }

    #[test]
    fn nodes_filter_is_appended_to_the_nodes_request() {
        let mut cfg = Config::default();
        cfg.nodes_filter = "bigmem".into();
        let cmds = Torque.create_submit_script(MSG, &cfg);
        assert!(cmds.contains(&"#PBS -l nodes=2:ppn=8:bigmem".to_string()));
    }

    #[test]
    fn user_filter_joins_the_site_filter_with_colons() {
        let msg = format!("{MSG}#TSI_BSS_NODES_FILTER gpu\n");
        let mut cfg = Config::default();
        cfg.nodes_filter = "bigmem".into();
        let cmds = Torque.create_submit_script(&msg, &cfg);
        assert!(cmds.contains(&"#PBS -l nodes=2:ppn=8:bigmem:gpu".to_string()));
    }

    #[test]
    fn user_filter_without_a_site_filter_is_dropped() {
        let msg = format!("{MSG}#TSI_BSS_NODES_FILTER gpu\n");
        let cmds = Torque.create_submit_script(&msg, &Config::default());
        assert!(cmds.contains(&"#PBS -l nodes=2:ppn=8".to_string()));
    }

    #[test]
    fn qstat_rows_parse() {
        let line =
            "1234.host.example  jdoe  batch  New_Script  16522  1  --  1000mb 00:00 R 00:00";
        assert_eq!(
            Torque.extract_info(line),
            Some(("1234".into(), "R".into(), "batch".into()))
        );
        assert!(Torque.extract_info("Job ID  Username Queue").is_none());
    }

    #[test]
    fn state_conversion() {
        assert_eq!(Torque.convert_status("Q"), JobState::Queued);
        assert_eq!(Torque.convert_status("W"), JobState::Queued);
        assert_eq!(Torque.convert_status("R"), JobState::Running);
        assert_eq!(Torque.convert_status("E"), JobState::Running);
        assert_eq!(Torque.convert_status("H"), JobState::Suspended);
        assert_eq!(Torque.convert_status("C"), JobState::Completed);
        assert_eq!(Torque.convert_status("?"), JobState::Unknown);
    }
}
