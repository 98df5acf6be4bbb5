//! Configuration loading.
//!
//! The configuration is a flat properties file, one `key = value` per line.
//! Typed settings live in [`Config`]; free-form settings such as the batch
//! system command lines stay in the `settings` map where the shepherd's
//! `set` verb can override them at runtime. Forked workers see a snapshot.

use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use tracing::{error, info, warn};

/// ACL flavor configured for a path prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclSupport {
    None,
    Posix,
    Nfs,
}

impl AclSupport {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "NONE" => Ok(Self::None),
            "POSIX" => Ok(Self::Posix),
            "NFS" => Ok(Self::Nfs),
            other => bail!("invalid ACL flavor '{other}', must be 'NONE', 'POSIX' or 'NFS'"),
        }
    }
}

/// A parsed distinguished-name allow-list entry: a set of attr=value pairs
/// that must all be present in a peer certificate subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnPattern(pub Vec<(String, String)>);

impl DnPattern {
    /// Parses an RFC 4514 style DN such as `CN=UNICORE/X,O=Test,C=EU`.
    /// Escaped commas (`\,`) are kept inside the value.
    pub fn parse(dn: &str) -> Result<Self> {
        let mut rdns = Vec::new();
        let mut current = String::new();
        let mut chars = dn.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(&next) = chars.peek() {
                        current.push(next);
                        chars.next();
                    }
                }
                ',' => {
                    rdns.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            }
        }
        rdns.push(current);

        let mut pairs = Vec::new();
        for rdn in rdns {
            let rdn = rdn.trim();
            if rdn.is_empty() {
                continue;
            }
            let (attr, value) = rdn
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed DN component '{rdn}' in '{dn}'"))?;
            pairs.push((attr.trim().to_uppercase(), value.trim().to_string()));
        }
        if pairs.is_empty() {
            bail!("empty DN '{dn}'");
        }
        Ok(Self(pairs))
    }

    /// The entry matches iff every one of its attr=value pairs appears in
    /// the peer subject.
    pub fn matches(&self, subject: &[(String, String)]) -> bool {
        self.0.iter().all(|pair| subject.contains(pair))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub listen_port: u16,
    pub disable_ipv6: bool,
    /// Local source-port range for outbound connections, inclusive.
    pub local_portrange: Option<(u16, u16)>,

    pub keystore: Option<PathBuf>,
    pub keystore_password: Option<String>,
    pub certificate: Option<PathBuf>,
    pub truststore: Option<PathBuf>,
    pub allowed_dns: Vec<DnPattern>,
    pub allowed_hosts: Vec<String>,
    /// Resolved at startup from `allowed_hosts`. Empty means "not
    /// configured" and is allowed with a warning.
    pub allowed_ips: Vec<IpAddr>,

    pub user_cache_ttl: Duration,
    pub enforce_os_gids: bool,
    pub fail_on_invalid_gids: bool,
    pub use_id_to_resolve_gids: bool,
    pub switch_uid: bool,
    pub open_user_sessions: bool,
    pub pam_module: String,
    pub use_login_shell: bool,
    pub safe_dir: PathBuf,

    /// Path prefix to ACL flavor, longest prefix wins.
    pub acl: Vec<(String, AclSupport)>,
    pub getfacl_cmd: Option<String>,
    pub setfacl_cmd: Option<String>,

    pub batch_variant: String,
    pub default_job_name: String,
    pub nodes_filter: String,
    pub keyfiles: Vec<String>,
    /// Bytes per second, 0 = unlimited.
    pub port_forwarding_rate_limit: u64,
    /// Overrides the callback port sent by the orchestrator.
    pub unicorex_port_override: Option<u16>,

    /// Free-form settings: batch command lines plus anything mutated by the
    /// shepherd's `set` verb.
    pub settings: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "localhost".into(),
            listen_port: 4433,
            disable_ipv6: false,
            local_portrange: None,
            keystore: None,
            keystore_password: None,
            certificate: None,
            truststore: None,
            allowed_dns: Vec::new(),
            allowed_hosts: vec!["localhost".into()],
            allowed_ips: Vec::new(),
            user_cache_ttl: Duration::from_secs(600),
            enforce_os_gids: true,
            fail_on_invalid_gids: false,
            use_id_to_resolve_gids: false,
            switch_uid: true,
            open_user_sessions: false,
            pam_module: "unicore-tsi".into(),
            use_login_shell: false,
            safe_dir: "/tmp".into(),
            acl: Vec::new(),
            getfacl_cmd: None,
            setfacl_cmd: None,
            batch_variant: "nobatch".into(),
            default_job_name: "UnicoreJob".into(),
            nodes_filter: String::new(),
            keyfiles: vec![".ssh/authorized_keys".into()],
            port_forwarding_rate_limit: 0,
            unicorex_port_override: None,
            settings: HashMap::new(),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => bail!("invalid value '{other}' for parameter '{key}', must be 'true' or 'false'"),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Reads and parses the properties file, then resolves the allowed
    /// orchestrator hosts.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        info!("reading config from {}", path.display());
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let mut config = Self::parse(&text)?;
        config.resolve_allowed_hosts();
        Ok(config)
    }

    /// Parses properties text. Lines not matching `key = value` are
    /// ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let mut config = Self::default();
        let line_re = Regex::new(r"^\s*([A-Za-z0-9.\-_/]+)\s*=\s*(.+)$").unwrap();
        for line in text.lines() {
            let Some(caps) = line_re.captures(line) else {
                continue;
            };
            let key = caps.get(1).unwrap().as_str();
            let value = caps.get(2).unwrap().as_str().trim();
            config.apply(key, value)?;
        }
        // keep the acl map ordered so the longest-prefix scan is stable
        config.acl.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        if let Some(path) = key.strip_prefix("acl.") {
            let support = AclSupport::parse(value)
                .with_context(|| format!("invalid value for parameter '{key}'"))?;
            self.acl.push((path.to_string(), support));
            return Ok(());
        }
        if key.starts_with("allowed_dn.") {
            let dn = DnPattern::parse(value)?;
            info!("allowing TLS connections for '{value}'");
            self.allowed_dns.push(dn);
            return Ok(());
        }
        match key {
            "listen_addr" => self.listen_addr = value.into(),
            "listen_port" => self.listen_port = value.parse().context("invalid listen_port")?,
            "disable_ipv6" => self.disable_ipv6 = parse_bool(key, value)?,
            "local_portrange" => {
                let (lo, hi) = value
                    .split_once(':')
                    .ok_or_else(|| anyhow!("local_portrange must be 'lo:hi'"))?;
                let lo: u16 = lo.trim().parse().context("invalid local_portrange")?;
                let hi: u16 = hi.trim().parse().context("invalid local_portrange")?;
                if lo > hi {
                    bail!("local_portrange is empty: {lo}:{hi}");
                }
                self.local_portrange = Some((lo, hi));
            }
            "keystore" => self.keystore = Some(value.into()),
            "keystore_password" => self.keystore_password = Some(value.into()),
            "certificate" => self.certificate = Some(value.into()),
            "truststore" => self.truststore = Some(value.into()),
            "allowed_orchestrator_hosts" => self.allowed_hosts = parse_list(value),
            "user_cache_ttl" => {
                self.user_cache_ttl =
                    Duration::from_secs(value.parse().context("invalid user_cache_ttl")?)
            }
            "enforce_os_gids" => self.enforce_os_gids = parse_bool(key, value)?,
            "fail_on_invalid_gids" => self.fail_on_invalid_gids = parse_bool(key, value)?,
            "use_id_to_resolve_gids" => self.use_id_to_resolve_gids = parse_bool(key, value)?,
            "switch_uid" => self.switch_uid = parse_bool(key, value)?,
            "open_user_sessions" => self.open_user_sessions = parse_bool(key, value)?,
            "pam_module" => self.pam_module = value.into(),
            "use_login_shell" => self.use_login_shell = parse_bool(key, value)?,
            "safe_dir" => self.safe_dir = value.into(),
            "getfacl_cmd" => self.getfacl_cmd = Some(value.into()),
            "setfacl_cmd" => self.setfacl_cmd = Some(value.into()),
            "batch_variant" => self.batch_variant = value.into(),
            "default_job_name" => self.default_job_name = value.into(),
            "nodes_filter" => self.nodes_filter = value.into(),
            "keyfiles" => self.keyfiles = parse_list(value),
            "port_forwarding_rate_limit" => {
                self.port_forwarding_rate_limit =
                    value.parse().context("invalid port_forwarding_rate_limit")?
            }
            "unicorex_port_override" => {
                self.unicorex_port_override =
                    Some(value.parse().context("invalid unicorex_port_override")?)
            }
            _ => {
                self.settings.insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    /// Resolves the allowed orchestrator hostnames to addresses once, at
    /// startup.
    pub fn resolve_allowed_hosts(&mut self) {
        self.allowed_ips.clear();
        info!("allowed orchestrator machines: {:?}", self.allowed_hosts);
        for host in &self.allowed_hosts {
            match (host.as_str(), 0u16).to_socket_addrs() {
                Ok(addrs) => {
                    for addr in addrs {
                        info!("access allowed from {} ({})", host, addr.ip());
                        self.allowed_ips.push(addr.ip());
                    }
                }
                Err(e) => error!("could not resolve '{host}': {e}"),
            }
        }
    }

    pub fn tls_enabled(&self) -> bool {
        self.keystore.is_some()
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(|s| s.as_str())
    }

    /// Looks up a configured command line, failing with a clear message
    /// when it was never set.
    pub fn command(&self, key: &str) -> Result<&str> {
        self.setting(key)
            .ok_or_else(|| anyhow!("no '{key}' command configured"))
    }

    /// Applies a runtime override from the shepherd's `set` verb.
    pub fn set_setting(&mut self, key: &str, value: &str) {
        info!("runtime setting update: {key} = {value}");
        self.settings.insert(key.to_string(), value.to_string());
    }

    /// Warns about settings that are not production ready.
    pub fn production_readiness_check(&self) {
        if self.allowed_ips.is_empty() {
            warn!("no list of allowed orchestrator IPs set, not production ready");
        }
        if self.tls_enabled() && self.allowed_dns.is_empty() {
            warn!("TLS is enabled but no allowed DNs are configured, all verified peers will be accepted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_properties() {
        let cfg = Config::parse(
            "# comment\n\
             listen_addr = 0.0.0.0\n\
             listen_port=14433\n\
             switch_uid=false\n\
             enforce_os_gids = 1\n\
             local_portrange=50000:50100\n\
             submit_cmd = sbatch\n\
             bogus line without equals\n",
        )
        .unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0");
        assert_eq!(cfg.listen_port, 14433);
        assert!(!cfg.switch_uid);
        assert!(cfg.enforce_os_gids);
        assert_eq!(cfg.local_portrange, Some((50000, 50100)));
        assert_eq!(cfg.setting("submit_cmd"), Some("sbatch"));
    }

    #[test]
    fn rejects_bad_booleans() {
        assert!(Config::parse("switch_uid=maybe\n").is_err());
    }

    #[test]
    fn parses_acl_map() {
        let cfg = Config::parse("acl./tmp=POSIX\nacl./tmp/foo=NFS\nacl./home=NONE\n").unwrap();
        // sorted longest prefix first
        assert_eq!(cfg.acl[0].0, "/tmp/foo");
        assert_eq!(cfg.acl[0].1, AclSupport::Nfs);
        assert!(Config::parse("acl./tmp=MAYBE\n").is_err());
    }

    #[test]
    fn parses_dn_entries() {
        let cfg =
            Config::parse("allowed_dn.1=CN=UNICORE/X,O=Test\nallowed_dn.2=CN=Backup\n").unwrap();
        assert_eq!(cfg.allowed_dns.len(), 2);
        assert_eq!(
            cfg.allowed_dns[0].0,
            vec![
                ("CN".to_string(), "UNICORE/X".to_string()),
                ("O".to_string(), "Test".to_string())
            ]
        );
    }

    #[test]
    fn dn_escaped_comma_stays_in_value() {
        let dn = DnPattern::parse(r"CN=Example\, Inc,C=EU").unwrap();
        assert_eq!(dn.0[0], ("CN".to_string(), "Example, Inc".to_string()));
    }

    #[test]
    fn dn_matching_requires_all_rdns() {
        let dn = DnPattern::parse("CN=UNICORE/X,O=Test").unwrap();
        let full = vec![
            ("C".to_string(), "EU".to_string()),
            ("O".to_string(), "Test".to_string()),
            ("CN".to_string(), "UNICORE/X".to_string()),
        ];
        assert!(dn.matches(&full));
        let partial = vec![("CN".to_string(), "UNICORE/X".to_string())];
        assert!(!dn.matches(&partial));
    }

    #[test]
    fn runtime_set_overrides_settings() {
        let mut cfg = Config::parse("submit_cmd=sbatch\n").unwrap();
        cfg.set_setting("submit_cmd", "sbatch --export=ALL");
        assert_eq!(cfg.setting("submit_cmd"), Some("sbatch --export=ALL"));
    }
}
