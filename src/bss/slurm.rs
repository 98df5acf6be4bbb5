//! Slurm adaptor.

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;

use super::{BatchSystem, JobState, SubmitParams};
use crate::config::Config;
use crate::connector::Connector;
use crate::msg::run_command;

pub struct Slurm;

impl Slurm {
    /// Directive arguments shared by sbatch scripts and salloc command
    /// lines.
    fn resource_args(&self, params: &SubmitParams<'_>) -> Vec<String> {
        let mut args = Vec::new();
        args.push(format!("--job-name={}", params.job_name));
        if params.queue != "NONE" {
            args.push(format!("--partition={}", params.queue));
        }
        if params.project != "NONE" {
            args.push(format!("--account={}", params.project));
        }
        if params.nodes > 0 {
            args.push(format!("--nodes={}", params.nodes));
            if params.processors_per_node > 0 {
                args.push(format!("--ntasks-per-node={}", params.processors_per_node));
            }
        } else if params.total_processors > 0 {
            // request tasks and let the scheduler figure out the nodes
            args.push(format!("--ntasks={}", params.total_processors));
        }
        // site and user constraints combine with Slurm's `&` operator
        let mut constraint = params.site_nodes_filter.clone();
        if let Some(user_filter) = params.user_nodes_filter {
            if constraint.is_empty() {
                constraint = user_filter.to_string();
            } else {
                constraint = format!("{constraint}&{user_filter}");
            }
        }
        if !constraint.is_empty() {
            args.push(format!("--constraint={constraint}"));
        }
        if params.qos != "NONE" {
            args.push(format!("--qos={}", params.qos));
        }
        if params.gpus_per_node > 0 {
            args.push(format!("--gpus-per-node={}", params.gpus_per_node));
        }
        if params.exclusive {
            args.push("--exclusive".to_string());
        }
        if let Some(comment) = params.comment {
            args.push(format!("--comment=\"{comment}\""));
        }
        if params.memory >= 0 {
            // per node; 0 requests all the memory on each node
            args.push(format!("--mem={}", params.memory));
        }
        if params.time > 0 {
            // wall clock time is given in seconds, Slurm takes minutes
            args.push(format!("--time={}", params.time / 60));
        }
        if params.email != "NONE" {
            args.push(format!("--mail-user={}", params.email));
            args.push("--mail-type=ALL".to_string());
        }
        if params.reservation != "NONE" {
            args.push(format!("--reservation={}", params.reservation));
        }
        args
    }
}

impl BatchSystem for Slurm {
    fn variant(&self) -> &'static str {
        "Slurm"
    }

    fn defaults(&self) -> Vec<(&'static str, &'static str)> {
        vec![
            ("submit_cmd", "sbatch"),
            ("qstat_cmd", "squeue -h -o \"%i %T %P\""),
            ("details_cmd", "scontrol show jobid"),
            ("abort_cmd", "scancel %s"),
            ("hold_cmd", "scontrol hold"),
            ("resume_cmd", "scontrol release"),
            ("alloc_cmd", "salloc --no-shell"),
            ("partitions_cmd", "sinfo --json"),
        ]
    }

    fn create_submit_script(&self, message: &str, config: &Config) -> Vec<String> {
        let mut params = SubmitParams::parse(message, config);
        let mut cmds = vec!["#!/bin/bash".to_string()];

        let array_spec = if params.array > 0 {
            params.stdout.push_str("%a");
            params.stderr.push_str("%a");
            if params.array_limit > 0 {
                Some(format!("{}%{}", params.array, params.array_limit))
            } else {
                Some(params.array.to_string())
            }
        } else {
            None
        };

        for arg in self.resource_args(&params) {
            cmds.push(format!("#SBATCH {arg}"));
        }
        if let Some(spec) = array_spec {
            cmds.push(format!("#SBATCH --array={spec}"));
            cmds.push(
                "UC_ARRAY_TASK_ID=\"$SLURM_ARRAY_TASK_ID\"; export UC_ARRAY_TASK_ID".to_string(),
            );
        }
        cmds.push(format!(
            "#SBATCH --output={}/{}",
            params.outcome_dir, params.stdout
        ));
        cmds.push(format!(
            "#SBATCH --error={}/{}",
            params.outcome_dir, params.stderr
        ));
        cmds.push(format!("#SBATCH --chdir={}", params.uspace_dir));
        if let Some(umask) = params.umask {
            cmds.push(format!("umask {umask}"));
        }
        cmds
    }

    fn create_alloc_script(&self, message: &str, config: &Config) -> Result<Vec<String>> {
        let params = SubmitParams::parse(message, config);
        let alloc_cmd = config.setting("alloc_cmd").unwrap_or("salloc --no-shell");
        let out_file = "UNICORE_alloc_output";
        let args = self.resource_args(&params).join(" ");
        Ok(vec![
            format!("{alloc_cmd} {args} > {out_file} 2>&1"),
            format!("grep -Eo '[0-9]+' {out_file} | head -1 > ALLOCATION_ID"),
        ])
    }

    fn job_id_expr(&self) -> &'static str {
        r"Submitted\D*(\d+)\D*"
    }

    fn extract_info(&self, qstat_line: &str) -> Option<(String, String, String)> {
        // expected output per `squeue -h -o "%i %T %P"`, array steps carry
        // an `_index` suffix on the id
        let re = Regex::new(r"^(\d+)_?\S*\s+(\w+)\s+(\w+)").unwrap();
        let caps = re.captures(qstat_line)?;
        Some((
            caps.get(1).unwrap().as_str().to_string(),
            caps.get(2).unwrap().as_str().to_string(),
            caps.get(3).unwrap().as_str().to_string(),
        ))
    }

    fn convert_status(&self, bss_state: &str) -> JobState {
        match bss_state {
            "PREEMPTED" | "STOPPED" | "SUSPENDED" => JobState::Suspended,
            "CONFIGURING" | "PENDING" | "RESV_DEL_HOLD" | "REQUEUE_FED" | "REQUEUE_HOLD" => {
                JobState::Queued
            }
            "COMPLETING" | "RUNNING" | "SIGNALING" | "STAGE_OUT" => JobState::Running,
            "BOOT_FAIL" | "CANCELLED" | "COMPLETED" | "DEADLINE" | "FAILED" | "NODE_FAIL"
            | "OUT_OF_MEMORY" | "REVOKED" | "TIMEOUT" => JobState::Completed,
            _ => JobState::Unknown,
        }
    }

    fn get_partitions(&self, connector: &mut dyn Connector, config: &Config) -> Result<()> {
        let cmd = config.command("partitions_cmd")?;
        let output = run_command(cmd, config.use_login_shell)?;
        // sanity check before passing the blob on
        let _: Value = serde_json::from_str(&output).context("unexpected partition listing")?;
        connector.ok(Some(&output))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::has_verb;

    fn config() -> Config {
        Config::default()
    }

    const SUBMIT_MSG: &str = "#!/bin/bash\n\
#TSI_SUBMIT\n\
#TSI_OUTCOME_DIR /work/out\n\
#TSI_USPACE_DIR /work\n\
#TSI_STDOUT stdout\n\
#TSI_STDERR stderr\n\
#TSI_QUEUE fast\n\
#TSI_PROJECT myproject\n\
#TSI_TIME 60\n\
#TSI_MEMORY 32\n\
#TSI_NODES 1\n\
#TSI_PROCESSORS_PER_NODE 64\n\
#TSI_ARRAY 10\n\
#TSI_ARRAY_LIMIT 2\n\
#TSI_BSS_NODES_FILTER NONE\n\
#TSI_JOBNAME test_job\n\
#TSI_SCRIPT\n\
echo \"Hello World!\"\n";

    fn has_directive(cmds: &[String], name: &str, value: Option<&str>) -> bool {
        cmds.iter().any(|line| {
            line.starts_with(name) && value.map(|v| line.contains(v)).unwrap_or(true)
        })
    }

    #[test]
    fn submit_script_directives() {
        let cmds = Slurm.create_submit_script(SUBMIT_MSG, &config());
        assert_eq!(cmds[0], "#!/bin/bash");
        assert!(has_directive(&cmds, "#SBATCH --partition", Some("fast")));
        assert!(has_directive(&cmds, "#SBATCH --account", Some("myproject")));
        assert!(has_directive(&cmds, "#SBATCH --nodes", Some("1")));
        assert!(has_directive(&cmds, "#SBATCH --ntasks-per-node", Some("64")));
        assert!(has_directive(&cmds, "#SBATCH --mem", Some("32")));
        assert!(has_directive(&cmds, "#SBATCH --time", Some("1")));
        assert!(has_directive(&cmds, "#SBATCH --array", Some("10%2")));
        assert!(has_directive(&cmds, "#SBATCH --job-name", Some("test_job")));
        assert!(has_directive(&cmds, "#SBATCH --output", Some("/work/out/stdout%a")));
        assert!(!has_directive(&cmds, "#SBATCH --constraint", None));
        assert!(!has_directive(&cmds, "#SBATCH --exclusive", None));
        // verb line survives only in the user job file, not the directives
        assert!(!cmds.iter().any(|l| has_verb(l, "TSI_SUBMIT")));
    }

    #[test]
    fn exclusive_and_zero_memory() {
        let msg = "#TSI_SUBMIT\n#TSI_USPACE_DIR /work\n#TSI_MEMORY 0\n#TSI_SSR_EXCLUSIVE true\n";
        let cmds = Slurm.create_submit_script(msg, &config());
        assert!(has_directive(&cmds, "#SBATCH --mem", Some("0")));
        assert!(has_directive(&cmds, "#SBATCH --exclusive", None));
    }

    #[test]
    fn user_nodes_filter_merges_with_site_filter() {
        let msg = "#TSI_SUBMIT\n#TSI_USPACE_DIR /work\n#TSI_BSS_NODES_FILTER gpu\n";
        let cmds = Slurm.create_submit_script(msg, &config());
        assert!(has_directive(&cmds, "#SBATCH --constraint", Some("gpu")));

        let mut cfg = config();
        cfg.nodes_filter = "highmem".into();
        let cmds = Slurm.create_submit_script(msg, &cfg);
        assert!(has_directive(&cmds, "#SBATCH --constraint", Some("highmem&gpu")));
    }

    #[test]
    fn alloc_script_runs_salloc_and_extracts_id() {
        let msg = "#TSI_SUBMIT\n#TSI_JOB_MODE allocate\n#TSI_USPACE_DIR /work\n\
                   #TSI_QUEUE fast\n#TSI_PROJECT myproject\n#TSI_TIME 600\n\
                   #TSI_MEMORY 32\n#TSI_NODES 4\n#TSI_PROCESSORS_PER_NODE 64\n\
                   #TSI_JOBNAME test_job\n";
        let cmds = Slurm.create_alloc_script(msg, &config()).unwrap();
        let all = cmds.join("\n");
        assert!(all.contains("salloc"));
        assert!(all.contains("--partition=fast"));
        assert!(all.contains("--account=myproject"));
        assert!(all.contains("--nodes=4"));
        assert!(all.contains("--ntasks-per-node=64"));
        assert!(all.contains("--mem=32"));
        assert!(all.contains("--time=10"));
        assert!(all.contains("ALLOCATION_ID"));
        assert!(!all.contains("--constraint"));
    }

    #[test]
    fn extracts_submitted_job_id() {
        assert_eq!(
            Slurm.extract_job_id("Submitted batch job 1234\n"),
            Some("1234".to_string())
        );
        assert_eq!(Slurm.extract_job_id("Error 123"), None);
    }

    #[test]
    fn squeue_listing_normalization() {
        let listing = "182027 PENDING large\n182580 RUNNING large\n177071_[0-99] PENDING small\n";
        let result = Slurm.parse_status_listing(listing);
        assert_eq!(
            result,
            "QSTAT\n 182027 QUEUED large\n 182580 RUNNING large\n 177071 QUEUED small\n"
        );
    }

    #[test]
    fn array_steps_collapse_to_one_job() {
        let listing = "177070_0 RUNNING large\n177070_1 PENDING large\n";
        let result = Slurm.parse_status_listing(listing);
        assert_eq!(result, "QSTAT\n 177070 RUNNING large\n");
    }

    #[test]
    fn state_table_is_total() {
        for raw in [
            "PREEMPTED",
            "STOPPED",
            "SUSPENDED",
            "CONFIGURING",
            "PENDING",
            "RESV_DEL_HOLD",
            "REQUEUE_FED",
            "REQUEUE_HOLD",
            "COMPLETING",
            "RUNNING",
            "SIGNALING",
            "STAGE_OUT",
            "BOOT_FAIL",
            "CANCELLED",
            "COMPLETED",
            "DEADLINE",
            "FAILED",
            "NODE_FAIL",
            "OUT_OF_MEMORY",
            "REVOKED",
            "TIMEOUT",
        ] {
            assert_ne!(Slurm.convert_status(raw), JobState::Unknown, "{raw}");
        }
        assert_eq!(Slurm.convert_status("SOMETHING_NEW"), JobState::Unknown);
    }
}
