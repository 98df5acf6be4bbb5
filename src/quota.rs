//! Compute budget reporting.
//!
//! Reply format: one line per project,
//! `<project_name> <remaining> <percent_remaining> <units>` with units in
//! core-h, cpu-h or node-h. Sites with an accounting system hook in here;
//! the stock implementation reports "no limit known".

use crate::config::Config;

pub fn get_quota(_config: &Config) -> String {
    "USER -1".to_string()
}
