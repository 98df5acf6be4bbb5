//! File ACL operations.
//!
//! ACL support is configured per path prefix (`acl.<path>=POSIX|NFS|NONE`);
//! the longest configured prefix that matches the request path decides the
//! flavor. POSIX ACLs are manipulated through the configured getfacl and
//! setfacl command lines. The NFS flavor is declared in the configuration
//! grammar but has no backing implementation.

use anyhow::{anyhow, bail, Result};
use tracing::debug;

use crate::config::{AclSupport, Config};
use crate::connector::Connector;
use crate::msg::{extract_parameter, run_command};

/// Longest string-prefix match of `path` against the configured ACL map.
pub fn check_support(path: &str, acl: &[(String, AclSupport)]) -> AclSupport {
    let mut best_len = 0;
    let mut best = AclSupport::None;
    for (prefix, support) in acl {
        if path.starts_with(prefix.as_str()) && prefix.len() > best_len {
            best_len = prefix.len();
            best = *support;
        }
    }
    best
}

// getfacl/setfacl change their output with POSIXLY_CORRECT set
fn unset_posixly_correct() {
    std::env::remove_var("POSIXLY_CORRECT");
}

fn getfacl_posix(path: &str, connector: &mut dyn Connector, config: &Config) -> Result<()> {
    unset_posixly_correct();
    let getfacl = config
        .getfacl_cmd
        .as_deref()
        .ok_or_else(|| anyhow!("POSIX ACL support disabled (commands not configured)"))?;
    let command = format!("{getfacl} '{path}'");
    debug!("{command}");
    let result = run_command(&command, config.use_login_shell)?;
    connector.ok(None)?;
    for line in result.lines() {
        if ["user", "group", "default:user", "default:group"]
            .iter()
            .any(|p| line.starts_with(p))
        {
            connector.write_message(line)?;
        }
    }
    Ok(())
}

/// Builds the setfacl entry argument from an abstract
/// `[D]U|G <subject> <rwx>` specification. An empty subject addresses the
/// owner respectively owning group entry.
fn prepare_posix_arg(spec: &str, remove: bool) -> Result<String> {
    let mut parts = spec.split(' ');
    let kind = parts.next().unwrap_or_default();
    let subject = parts.next().unwrap_or_default();
    let perms = parts.next().unwrap_or_default();
    let base = match kind.trim_start_matches('D') {
        "U" => "user",
        "G" => "group",
        _ => bail!("WRONG SETFACL SYNTAX"),
    };
    let mut arg = format!("{base}:{subject}");
    if !remove {
        arg.push(':');
        arg.push_str(perms);
    }
    Ok(arg)
}

fn setfacl_posix(
    path: &str,
    operation: &str,
    spec: &str,
    connector: &mut dyn Connector,
    config: &Config,
) -> Result<()> {
    unset_posixly_correct();
    let setfacl = config
        .setfacl_cmd
        .as_deref()
        .ok_or_else(|| anyhow!("POSIX ACL support disabled (commands not configured)"))?;
    let recursive = if operation.contains("RECURSIVE") {
        "-R "
    } else {
        ""
    };

    let command = if operation.contains("RM_ALL") {
        format!("{setfacl} -b {recursive}'{path}'")
    } else {
        let mut base_arg = String::new();
        if spec.starts_with('D') {
            // default ACL entries of a directory
            base_arg.push_str("-d ");
        }
        let remove = if operation.contains("MODIFY") {
            base_arg.push_str("-m");
            false
        } else if operation.contains("RM") {
            base_arg.push_str("-x");
            true
        } else {
            bail!("WRONG SETFACL SYNTAX");
        };
        let arg = prepare_posix_arg(spec, remove)?;
        format!("{setfacl} {recursive}{base_arg} {arg} '{path}'")
    };

    debug!("{command}");
    run_command(&command, config.use_login_shell)?;
    connector.ok(None)?;
    Ok(())
}

/// Entry point for the TSI_FILE_ACL verb.
pub fn process_acl(message: &str, connector: &mut dyn Connector, config: &Config) -> Result<()> {
    let operation = extract_parameter(message, "ACL_OPERATION")
        .ok_or_else(|| anyhow!("missing TSI_ACL_OPERATION"))?;
    let path =
        extract_parameter(message, "ACL_PATH").ok_or_else(|| anyhow!("missing TSI_ACL_PATH"))?;
    let support = check_support(path, &config.acl);

    match operation {
        "CHECK_SUPPORT" => {
            let answer = if support == AclSupport::None {
                "false"
            } else {
                "true"
            };
            connector.ok(Some(answer))?;
        }
        "GETFACL" => match support {
            AclSupport::Posix => getfacl_posix(path, connector, config)?,
            AclSupport::Nfs => bail!("ERROR: Getting NFS ACL is not supported."),
            AclSupport::None => {
                bail!("ERROR: Getting ACL on this file system is unsupported.")
            }
        },
        "SETFACL" => {
            let command = extract_parameter(message, "ACL_COMMAND")
                .ok_or_else(|| anyhow!("Missing parameter TSI_ACL_COMMAND"))?;
            let spec = extract_parameter(message, "ACL_COMMAND_SPEC").unwrap_or_default();
            if !command.contains("RM_ALL") && spec.is_empty() {
                bail!("Missing parameter TSI_ACL_COMMAND_SPEC");
            }
            match support {
                AclSupport::Posix => setfacl_posix(path, command, spec, connector, config)?,
                AclSupport::Nfs => bail!("ERROR: Setting NFS ACL is not supported."),
                AclSupport::None => {
                    bail!("ERROR: Setting ACL on this file system is unsupported.")
                }
            }
        }
        other => bail!("UNSUPPORTED_OPERATION: '{other}'"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::testing::MockConnector;

    fn acl_map() -> Vec<(String, AclSupport)> {
        vec![
            ("/tmp".to_string(), AclSupport::Posix),
            ("/tmp/foo".to_string(), AclSupport::Nfs),
        ]
    }

    #[test]
    fn longest_prefix_wins() {
        let map = acl_map();
        assert_eq!(check_support("/tmp/foo/bar", &map), AclSupport::Nfs);
        assert_eq!(check_support("/tmp/other", &map), AclSupport::Posix);
        assert_eq!(check_support("/usr", &map), AclSupport::None);
    }

    #[test]
    fn prefix_match_is_textual_not_per_segment() {
        let map = vec![("/tmp/foo".to_string(), AclSupport::Posix)];
        assert_eq!(check_support("/tmp/foobar", &map), AclSupport::Posix);
    }

    #[test]
    fn check_support_replies_true_false() {
        let mut config = Config::default();
        config.acl = acl_map();
        let mut conn = MockConnector::default();
        process_acl(
            "#TSI_FILE_ACL\n#TSI_ACL_OPERATION CHECK_SUPPORT\n#TSI_ACL_PATH /tmp/x\n",
            &mut conn,
            &config,
        )
        .unwrap();
        assert_eq!(conn.control_out, "TSI_OK\ntrue\n");

        let mut conn = MockConnector::default();
        process_acl(
            "#TSI_FILE_ACL\n#TSI_ACL_OPERATION CHECK_SUPPORT\n#TSI_ACL_PATH /usr\n",
            &mut conn,
            &config,
        )
        .unwrap();
        assert_eq!(conn.control_out, "TSI_OK\nfalse\n");
    }

    #[test]
    fn spec_assembly() {
        assert_eq!(prepare_posix_arg("U alice rwx", false).unwrap(), "user:alice:rwx");
        assert_eq!(prepare_posix_arg("DG staff r-x", false).unwrap(), "group:staff:r-x");
        assert_eq!(prepare_posix_arg("U alice rwx", true).unwrap(), "user:alice");
        // empty subject targets the owner entry
        assert_eq!(prepare_posix_arg("U  rwx", false).unwrap(), "user::rwx");
        assert!(prepare_posix_arg("X alice rwx", false).is_err());
    }

    #[test]
    fn nfs_operations_are_typed_failures() {
        let mut config = Config::default();
        config.acl = acl_map();
        let mut conn = MockConnector::default();
        let err = process_acl(
            "#TSI_FILE_ACL\n#TSI_ACL_OPERATION GETFACL\n#TSI_ACL_PATH /tmp/foo/x\n",
            &mut conn,
            &config,
        )
        .unwrap_err();
        assert!(err.to_string().contains("NFS"));
    }

    #[test]
    fn unknown_operation_is_rejected() {
        let config = Config::default();
        let mut conn = MockConnector::default();
        let err = process_acl(
            "#TSI_FILE_ACL\n#TSI_ACL_OPERATION FROBNICATE\n#TSI_ACL_PATH /tmp\n",
            &mut conn,
            &config,
        )
        .unwrap_err();
        assert!(err.to_string().contains("UNSUPPORTED_OPERATION"));
    }
}
