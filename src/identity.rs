//! User switching.
//!
//! A privileged worker assumes the requested account's identity (real and
//! effective uid, primary gid, supplementary groups) for the duration of
//! one request and is restored afterwards, on every exit path. The raw
//! syscalls sit behind [`IdentityOps`] so the resolution rules can be
//! tested without privileges.

use std::collections::HashSet;

use nix::unistd::{getgroups, getresgid, getresuid, setgroups, setresgid, setresuid, Gid, Uid};
use tracing::{info, warn};

use crate::cache::UserCache;
use crate::config::Config;

/// Requested-group placeholder: use the account's default for this slot.
pub const DEFAULT_GID: &str = "DEFAULT_GID";
/// Requested-primary placeholder: use the account defaults for everything.
pub const NONE_GROUP: &str = "NONE";

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("attempted to run a task for an unknown user {0}")]
    UnknownUser(String),
    #[error("attempted to run a command as root ({0})")]
    RootRefused(String),
    #[error("running as root and not switching uids, this is not allowed")]
    RootWithoutSwitching,
    #[error("attempt to run a task with an unknown {kind} group: {group}")]
    UnknownGroup { kind: &'static str, group: String },
    #[error("the user {user} is not a member of the group {group}")]
    NotAMember { user: String, group: String },
    #[error("could not switch identity for {user}: {detail}")]
    Mismatch { user: String, detail: String },
    #[error("identity syscall failed: {0}")]
    Os(#[from] nix::Error),
}

/// The handful of process-identity operations the switcher needs.
pub trait IdentityOps {
    fn resuid(&self) -> nix::Result<(u32, u32, u32)>;
    fn resgid(&self) -> nix::Result<(u32, u32, u32)>;
    fn groups(&self) -> nix::Result<Vec<u32>>;
    fn setresuid(&mut self, real: u32, effective: u32, saved: u32) -> nix::Result<()>;
    fn setresgid(&mut self, real: u32, effective: u32, saved: u32) -> nix::Result<()>;
    fn setgroups(&mut self, gids: &[u32]) -> nix::Result<()>;
    fn set_env(&mut self, key: &str, value: &str);
}

/// Identity operations against the real kernel.
pub struct HostOs;

impl IdentityOps for HostOs {
    fn resuid(&self) -> nix::Result<(u32, u32, u32)> {
        let ids = getresuid()?;
        Ok((
            ids.real.as_raw(),
            ids.effective.as_raw(),
            ids.saved.as_raw(),
        ))
    }

    fn resgid(&self) -> nix::Result<(u32, u32, u32)> {
        let ids = getresgid()?;
        Ok((
            ids.real.as_raw(),
            ids.effective.as_raw(),
            ids.saved.as_raw(),
        ))
    }

    fn groups(&self) -> nix::Result<Vec<u32>> {
        Ok(getgroups()?.iter().map(|g| g.as_raw()).collect())
    }

    fn setresuid(&mut self, real: u32, effective: u32, saved: u32) -> nix::Result<()> {
        setresuid(
            Uid::from_raw(real),
            Uid::from_raw(effective),
            Uid::from_raw(saved),
        )
    }

    fn setresgid(&mut self, real: u32, effective: u32, saved: u32) -> nix::Result<()> {
        setresgid(
            Gid::from_raw(real),
            Gid::from_raw(effective),
            Gid::from_raw(saved),
        )
    }

    fn setgroups(&mut self, gids: &[u32]) -> nix::Result<()> {
        let gids: Vec<Gid> = gids.iter().map(|&g| Gid::from_raw(g)).collect();
        setgroups(&gids)
    }

    fn set_env(&mut self, key: &str, value: &str) {
        std::env::set_var(key, value);
    }
}

/// Switches the worker between its privileged identity and a requested
/// user identity. Stores the privileged uid/gid at startup and always
/// switches back to them.
pub struct UserSwitch<O: IdentityOps> {
    ops: O,
    switch_uid: bool,
    privileged_uid: u32,
    privileged_gid: u32,
}

impl<O: IdentityOps> UserSwitch<O> {
    pub fn initialize(ops: O, config: &Config) -> Result<Self, IdentityError> {
        let (_, euid, _) = ops.resuid()?;
        let (_, egid, _) = ops.resgid()?;
        // a root process always switches, whatever the config says
        let switch_uid = config.switch_uid || euid == 0;
        if switch_uid {
            info!("running privileged, operations will be performed as the requested user");
        } else {
            info!("running unprivileged");
        }
        if config.enforce_os_gids {
            info!("groups of the user will be limited to those available in the OS");
        } else {
            info!("requested groups are accepted regardless of the OS settings");
        }
        Ok(Self {
            ops,
            switch_uid,
            privileged_uid: euid,
            privileged_gid: egid,
        })
    }

    /// A switch that never changes identity, for exercising handlers in
    /// tests regardless of the uid the test runner happens to have.
    #[cfg(test)]
    pub fn unswitched(ops: O) -> Self {
        Self {
            ops,
            switch_uid: false,
            privileged_uid: 1000,
            privileged_gid: 1000,
        }
    }

    pub fn switching(&self) -> bool {
        self.switch_uid
    }

    pub fn privileged_uid(&self) -> u32 {
        self.privileged_uid
    }

    /// Assumes the identity of `user`. `requested_groups[0]` is the primary
    /// group; the placeholders [`DEFAULT_GID`] and [`NONE_GROUP`] select
    /// the account defaults. Verifies the kernel view afterwards and fails
    /// hard on any mismatch rather than continue half switched.
    pub fn become_user(
        &mut self,
        user: &str,
        requested_groups: &[&str],
        cache: &mut UserCache,
        config: &Config,
    ) -> Result<(), IdentityError> {
        if !self.switch_uid {
            if self.privileged_uid == 0 {
                return Err(IdentityError::RootWithoutSwitching);
            }
            return Ok(());
        }

        let new_uid = cache
            .uid_of(user)
            .ok_or_else(|| IdentityError::UnknownUser(user.to_string()))?;
        if new_uid == 0 {
            return Err(IdentityError::RootRefused(user.to_string()));
        }

        let primary = requested_groups.first().copied().unwrap_or(NONE_GROUP);
        let (new_gid, new_gids) = if primary == NONE_GROUP {
            let gid = cache
                .primary_gid_of(user)
                .ok_or_else(|| IdentityError::UnknownUser(user.to_string()))?;
            (gid, cache.all_gids_of(user))
        } else {
            let gid = self.resolve_primary(primary, user, cache, config)?;
            let gids = self.resolve_supplementary(requested_groups, gid, user, cache, config)?;
            (gid, gids)
        };

        // order matters: group identity must be settled while we still
        // hold the privileged uid
        self.ops.setresgid(new_gid, new_gid, new_gid)?;
        self.ops.setgroups(&new_gids)?;
        self.ops.setresuid(new_uid, new_uid, self.privileged_uid)?;

        let (ruid, euid, _) = self.ops.resuid()?;
        if (ruid, euid) != (new_uid, new_uid) {
            return Err(IdentityError::Mismatch {
                user: user.to_string(),
                detail: format!("uid is ({ruid},{euid}), wanted {new_uid}"),
            });
        }
        let (rgid, egid, _) = self.ops.resgid()?;
        if (rgid, egid) != (new_gid, new_gid) {
            return Err(IdentityError::Mismatch {
                user: user.to_string(),
                detail: format!("gid is ({rgid},{egid}), wanted {new_gid}"),
            });
        }
        let have: HashSet<u32> = self.ops.groups()?.into_iter().collect();
        let want: HashSet<u32> = new_gids.iter().copied().collect();
        if have != want {
            return Err(IdentityError::Mismatch {
                user: user.to_string(),
                detail: format!("supplementary groups are {have:?}, wanted {want:?}"),
            });
        }

        if let Some(home) = cache.home_of(user) {
            self.ops.set_env("HOME", &home);
        }
        self.ops.set_env("USER", user);
        self.ops.set_env("LOGNAME", user);
        Ok(())
    }

    fn resolve_primary(
        &self,
        primary: &str,
        user: &str,
        cache: &mut UserCache,
        config: &Config,
    ) -> Result<u32, IdentityError> {
        fn default(cache: &mut UserCache, user: &str) -> Result<u32, IdentityError> {
            cache
                .primary_gid_of(user)
                .ok_or_else(|| IdentityError::UnknownUser(user.to_string()))
        }
        if primary == DEFAULT_GID {
            return default(cache, user);
        }
        let gid = match cache.gid_of_group(primary) {
            Some(gid) => gid,
            None => {
                if config.fail_on_invalid_gids {
                    return Err(IdentityError::UnknownGroup {
                        kind: "primary",
                        group: primary.to_string(),
                    });
                }
                warn!("requested primary group {primary} is not available on the OS, using the default for {user}");
                return default(cache, user);
            }
        };
        if !self.check_membership(gid, user, cache, config) {
            if config.fail_on_invalid_gids {
                return Err(IdentityError::NotAMember {
                    user: user.to_string(),
                    group: primary.to_string(),
                });
            }
            warn!("user {user} is not a member of group {primary}, using the default group");
            return default(cache, user);
        }
        Ok(gid)
    }

    fn resolve_supplementary(
        &self,
        requested: &[&str],
        primary_gid: u32,
        user: &str,
        cache: &mut UserCache,
        config: &Config,
    ) -> Result<Vec<u32>, IdentityError> {
        let mut gids: Vec<u32> = vec![primary_gid];
        let mut added_default = false;
        for &group in requested.iter().skip(1) {
            if group == DEFAULT_GID {
                if !added_default {
                    added_default = true;
                    for gid in cache.all_gids_of(user) {
                        if !gids.contains(&gid) {
                            gids.push(gid);
                        }
                    }
                }
                continue;
            }
            let gid = match cache.gid_of_group(group) {
                Some(gid) => gid,
                None => {
                    if config.fail_on_invalid_gids {
                        return Err(IdentityError::UnknownGroup {
                            kind: "supplementary",
                            group: group.to_string(),
                        });
                    }
                    warn!("requested supplementary group {group} is not available on the OS, ignoring");
                    continue;
                }
            };
            if !self.check_membership(gid, user, cache, config) {
                if config.fail_on_invalid_gids {
                    return Err(IdentityError::NotAMember {
                        user: user.to_string(),
                        group: group.to_string(),
                    });
                }
                warn!("user {user} is not a member of group {group}, skipping it");
                continue;
            }
            if !gids.contains(&gid) {
                gids.push(gid);
            }
        }
        Ok(gids)
    }

    /// The requested group is acceptable if it is the account's primary
    /// group, if checking is disabled, or if the OS lists the user as a
    /// member.
    fn check_membership(
        &self,
        gid: u32,
        user: &str,
        cache: &mut UserCache,
        config: &Config,
    ) -> bool {
        if !config.enforce_os_gids {
            return true;
        }
        if cache.primary_gid_of(user) == Some(gid) {
            return true;
        }
        cache.all_gids_of(user).contains(&gid)
    }

    /// Restores the privileged identity and resets the environment to
    /// harmless values.
    pub fn restore(&mut self) -> Result<(), IdentityError> {
        if !self.switch_uid {
            return Ok(());
        }
        let uid = self.privileged_uid;
        let gid = self.privileged_gid;
        self.ops.setresuid(uid, uid, uid)?;
        self.ops.setresgid(gid, gid, gid)?;
        self.ops.setgroups(&[gid])?;
        self.ops.set_env("HOME", "/tmp");
        self.ops.set_env("USER", "nobody");
        self.ops.set_env("LOGNAME", "nobody");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Records identity calls instead of issuing syscalls.
    struct FakeOs {
        resuid: (u32, u32, u32),
        resgid: (u32, u32, u32),
        groups: Vec<u32>,
        env: Vec<(String, String)>,
        calls: Vec<String>,
        fail_setresuid: bool,
    }

    impl FakeOs {
        fn privileged() -> Self {
            Self {
                resuid: (0, 0, 0),
                resgid: (0, 0, 0),
                groups: vec![0],
                env: Vec::new(),
                calls: Vec::new(),
                fail_setresuid: false,
            }
        }
    }

    impl IdentityOps for FakeOs {
        fn resuid(&self) -> nix::Result<(u32, u32, u32)> {
            Ok(self.resuid)
        }
        fn resgid(&self) -> nix::Result<(u32, u32, u32)> {
            Ok(self.resgid)
        }
        fn groups(&self) -> nix::Result<Vec<u32>> {
            Ok(self.groups.clone())
        }
        fn setresuid(&mut self, r: u32, e: u32, s: u32) -> nix::Result<()> {
            if self.fail_setresuid {
                return Err(nix::errno::Errno::EPERM);
            }
            self.calls.push(format!("setresuid({r},{e},{s})"));
            self.resuid = (r, e, s);
            Ok(())
        }
        fn setresgid(&mut self, r: u32, e: u32, s: u32) -> nix::Result<()> {
            self.calls.push(format!("setresgid({r},{e},{s})"));
            self.resgid = (r, e, s);
            Ok(())
        }
        fn setgroups(&mut self, gids: &[u32]) -> nix::Result<()> {
            self.calls.push(format!("setgroups({gids:?})"));
            self.groups = gids.to_vec();
            Ok(())
        }
        fn set_env(&mut self, key: &str, value: &str) {
            self.env.push((key.to_string(), value.to_string()));
        }
    }

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.switch_uid = true;
        cfg.enforce_os_gids = false;
        cfg
    }

    fn cache() -> UserCache {
        UserCache::new(Duration::from_secs(600), false)
    }

    #[test]
    fn unknown_user_is_refused() {
        let cfg = test_config();
        let mut switch = UserSwitch::initialize(FakeOs::privileged(), &cfg).unwrap();
        let err = switch
            .become_user("no-such-user-here", &["NONE"], &mut cache(), &cfg)
            .unwrap_err();
        assert!(matches!(err, IdentityError::UnknownUser(_)));
        // no syscalls before the refusal
        assert!(switch.ops.calls.is_empty());
    }

    #[test]
    fn becoming_root_is_refused() {
        let cfg = test_config();
        let mut switch = UserSwitch::initialize(FakeOs::privileged(), &cfg).unwrap();
        let err = switch
            .become_user("root", &["NONE"], &mut cache(), &cfg)
            .unwrap_err();
        assert!(matches!(err, IdentityError::RootRefused(_)));
        assert!(switch.ops.calls.is_empty());
    }

    #[test]
    fn unprivileged_without_switching_is_a_noop() {
        let mut cfg = test_config();
        cfg.switch_uid = false;
        let mut ops = FakeOs::privileged();
        ops.resuid = (1000, 1000, 1000);
        ops.resgid = (1000, 1000, 1000);
        let mut switch = UserSwitch::initialize(ops, &cfg).unwrap();
        switch
            .become_user("root", &["NONE"], &mut cache(), &cfg)
            .unwrap();
        assert!(switch.ops.calls.is_empty());
        switch.restore().unwrap();
        assert!(switch.ops.calls.is_empty());
    }

    #[test]
    fn root_without_switching_is_refused() {
        let mut cfg = test_config();
        cfg.switch_uid = false;
        // euid 0 forces switching back on, so make the lookup fail instead
        let mut switch = UserSwitch {
            ops: FakeOs::privileged(),
            switch_uid: false,
            privileged_uid: 0,
            privileged_gid: 0,
        };
        let err = switch
            .become_user("anybody", &["NONE"], &mut cache(), &cfg)
            .unwrap_err();
        assert!(matches!(err, IdentityError::RootWithoutSwitching));
    }

    #[test]
    fn restore_returns_to_privileged_identity() {
        let cfg = test_config();
        let mut switch = UserSwitch::initialize(FakeOs::privileged(), &cfg).unwrap();
        switch.restore().unwrap();
        assert_eq!(switch.ops.resuid, (0, 0, 0));
        assert_eq!(switch.ops.resgid, (0, 0, 0));
        assert_eq!(switch.ops.groups, vec![0]);
        let env = &switch.ops.env;
        assert!(env.contains(&("HOME".into(), "/tmp".into())));
        assert!(env.contains(&("USER".into(), "nobody".into())));
    }

    #[test]
    fn failed_switch_leaves_no_environment_changes() {
        let cfg = test_config();
        let mut ops = FakeOs::privileged();
        ops.fail_setresuid = true;
        let mut switch = UserSwitch::initialize(ops, &cfg).unwrap();
        // root's uid resolves to 0 and is refused earlier, so target a
        // real unprivileged account when one exists
        let mut c = cache();
        let Some(user) = ["daemon", "nobody", "bin"]
            .iter()
            .find(|u| matches!(c.uid_of(u), Some(uid) if uid != 0))
        else {
            return;
        };
        let err = switch
            .become_user(user, &["NONE"], &mut c, &cfg)
            .unwrap_err();
        assert!(matches!(err, IdentityError::Os(_)));
        assert!(switch.ops.env.is_empty());
    }
}
