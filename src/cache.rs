//! Caches account information (uid, gids, home directory) so that each
//! request does not hammer the account database. Entries expire after the
//! configured TTL; failed lookups are never treated as fresh, so unknown
//! names are retried on the next request.

use std::collections::HashMap;
use std::ffi::CStr;
use std::time::{Duration, Instant};

use nix::unistd::{Gid, Group, Uid, User};
use tracing::debug;

use crate::msg::run_command;

#[derive(Default)]
struct UserEntry {
    uid: Option<u32>,
    gid: Option<u32>,
    home: Option<String>,
    all_gids: Vec<u32>,
    ts: Option<Instant>,
}

#[derive(Default)]
struct GroupEntry {
    gid: Option<u32>,
    ts: Option<Instant>,
}

pub struct UserCache {
    ttl: Duration,
    use_id_to_resolve_gids: bool,
    users: HashMap<String, UserEntry>,
    groups: HashMap<String, GroupEntry>,
}

impl UserCache {
    pub fn new(ttl: Duration, use_id_to_resolve_gids: bool) -> Self {
        Self {
            ttl,
            use_id_to_resolve_gids,
            users: HashMap::new(),
            groups: HashMap::new(),
        }
    }

    fn expired(&self, ts: Option<Instant>) -> bool {
        match ts {
            None => true,
            Some(ts) => ts.elapsed() > self.ttl,
        }
    }

    pub fn uid_of(&mut self, user: &str) -> Option<u32> {
        self.prepare_user(user);
        self.users.get(user).and_then(|e| e.uid)
    }

    pub fn primary_gid_of(&mut self, user: &str) -> Option<u32> {
        self.prepare_user(user);
        self.users.get(user).and_then(|e| e.gid)
    }

    pub fn home_of(&mut self, user: &str) -> Option<String> {
        self.prepare_user(user);
        self.users.get(user).and_then(|e| e.home.clone())
    }

    /// All gids the user is a member of, including the primary. Empty when
    /// the user is unknown.
    pub fn all_gids_of(&mut self, user: &str) -> Vec<u32> {
        self.prepare_user(user);
        self.users
            .get(user)
            .map(|e| e.all_gids.clone())
            .unwrap_or_default()
    }

    pub fn gid_of_group(&mut self, group: &str) -> Option<u32> {
        let entry = self.groups.get(group);
        if self.expired(entry.and_then(|e| e.ts)) {
            self.refresh_group(group);
        }
        let entry = self.groups.get(group).unwrap();
        if entry.ts.is_none() {
            debug!("unknown group name requested: {group}");
        }
        entry.gid
    }

    fn prepare_user(&mut self, user: &str) {
        let ts = self.users.get(user).and_then(|e| e.ts);
        if self.expired(ts) {
            self.refresh_user(user);
            if self.users.get(user).and_then(|e| e.ts).is_none() {
                debug!("unknown user name requested: {user}");
            }
        }
    }

    fn refresh_group(&mut self, group: &str) {
        let mut entry = GroupEntry::default();
        if let Ok(Some(g)) = Group::from_name(group) {
            entry.gid = Some(g.gid.as_raw());
            entry.ts = Some(Instant::now());
        }
        self.groups.insert(group.to_string(), entry);
    }

    fn refresh_user(&mut self, user: &str) {
        let mut entry = UserEntry::default();
        if let Ok(Some(u)) = User::from_name(user) {
            let gid = u.gid.as_raw();
            entry.uid = Some(u.uid.as_raw());
            entry.gid = Some(gid);
            entry.home = Some(u.dir.to_string_lossy().into_owned());
            entry.all_gids = if self.use_id_to_resolve_gids {
                gids_via_id(user, gid)
            } else {
                gids_via_group_db(user, gid)
            };
            // failed group resolution leaves the timestamp unset so the
            // next lookup retries
            if !entry.all_gids.is_empty() {
                entry.ts = Some(Instant::now());
            }
            debug!("groups for user {user}: {:?}", entry.all_gids);
        }
        self.users.insert(user.to_string(), entry);
    }
}

/// Resolves the supplementary groups with `id -G <user>`, for hosts where
/// enumerating the whole group database is impractical (LDAP, SSSD).
fn gids_via_id(user: &str, primary: u32) -> Vec<u32> {
    let output = match run_command(&format!("id -G {user}"), false) {
        Ok(out) => out,
        Err(e) => {
            debug!("id -G {user} failed: {e}");
            return Vec::new();
        }
    };
    match parse_id_output(&output) {
        Some(mut gids) => {
            if !gids.contains(&primary) {
                gids.push(primary);
            }
            gids
        }
        None => Vec::new(),
    }
}

fn parse_id_output(output: &str) -> Option<Vec<u32>> {
    let mut gids = Vec::new();
    for token in output.split_whitespace() {
        gids.push(token.parse::<u32>().ok()?);
    }
    if gids.is_empty() {
        None
    } else {
        Some(gids)
    }
}

/// Scans the group database for memberships of `user`.
fn gids_via_group_db(user: &str, primary: u32) -> Vec<u32> {
    let mut gids = Vec::new();
    unsafe {
        libc::setgrent();
        loop {
            let grp = libc::getgrent();
            if grp.is_null() {
                break;
            }
            let grp = &*grp;
            let mut member = grp.gr_mem;
            while !member.is_null() && !(*member).is_null() {
                if CStr::from_ptr(*member).to_str() == Ok(user) {
                    gids.push(grp.gr_gid);
                    break;
                }
                member = member.add(1);
            }
        }
        libc::endgrent();
    }
    if !gids.contains(&primary) {
        gids.push(primary);
    }
    gids
}

/// Resolves a uid back to an account name, for listings.
pub fn name_of_uid(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(u)) => u.name,
        _ => uid.to_string(),
    }
}

/// Resolves a gid back to a group name, for listings.
pub fn name_of_gid(gid: u32) -> String {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(g)) => g.name,
        _ => gid.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_id_output() {
        assert_eq!(parse_id_output("100 4 27\n"), Some(vec![100, 4, 27]));
        assert_eq!(parse_id_output("100 oops"), None);
        assert_eq!(parse_id_output(""), None);
    }

    #[test]
    fn unknown_user_is_not_cached_as_fresh() {
        let mut cache = UserCache::new(Duration::from_secs(600), false);
        assert_eq!(cache.uid_of("no-such-user-here"), None);
        // the entry exists but carries no timestamp
        assert!(cache.users.get("no-such-user-here").unwrap().ts.is_none());
    }

    #[test]
    fn root_resolves() {
        let mut cache = UserCache::new(Duration::from_secs(600), false);
        assert_eq!(cache.uid_of("root"), Some(0));
        assert_eq!(cache.primary_gid_of("root"), Some(0));
        assert!(cache.home_of("root").is_some());
        assert!(cache.all_gids_of("root").contains(&0));
    }

    #[test]
    fn group_lookup_resolves_root() {
        let mut cache = UserCache::new(Duration::from_secs(600), false);
        let gid = cache.gid_of_group("root");
        assert_eq!(gid, Some(0));
        assert_eq!(cache.gid_of_group("no-such-group-here"), None);
    }
}
