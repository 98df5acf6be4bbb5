//! The shepherd: owns the listening socket, authenticates incoming
//! orchestrator connections, and forks one worker process per session.
//!
//! Control protocol (one line per accepted connection):
//!   - `newtsiprocess <port>`: reply `OK`, call the orchestrator back on
//!     two fresh connections (command and data) and fork a worker that
//!     speaks the message protocol on them.
//!   - `start-forwarding <port> <target> <user>:<groups>`: reply `OK`,
//!     call back once and fork a forwarding worker running under the
//!     requested identity.
//!   - `set <key> <value>`: update a runtime setting (affects future
//!     workers, not running ones).
//!   - `shutdown`: close the listener and exit.

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    bind, connect, setsockopt, sockopt, socket, AddressFamily, Backlog, SockFlag, SockType,
    SockaddrStorage,
};
use nix::unistd::{fork, ForkResult};
use rustls::{ClientConnection, ServerConnection, StreamOwned};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connector::{Channel, SocketConnector};
use crate::dispatch;
use crate::err;
use crate::forward;
use crate::identity::{HostOs, UserSwitch};
use crate::tls::{self, TlsContext};

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Round-robin source-port chooser for outbound connections.
pub struct PortRange {
    lo: u16,
    hi: u16,
    next: u16,
}

impl PortRange {
    pub fn new((lo, hi): (u16, u16)) -> Self {
        Self { lo, hi, next: lo }
    }

    pub fn len(&self) -> usize {
        (self.hi - self.lo) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_port(&mut self) -> u16 {
        let port = self.next;
        self.next = if port >= self.hi { self.lo } else { port + 1 };
        port
    }
}

/// Keepalive probing so dead peers are noticed within seconds.
pub fn configure_keepalive<F: AsFd>(sock: &F) {
    let _ = setsockopt(sock, sockopt::KeepAlive, &true);
    #[cfg(target_os = "linux")]
    {
        let _ = setsockopt(sock, sockopt::TcpKeepIdle, &5);
        let _ = setsockopt(sock, sockopt::TcpKeepInterval, &1);
        let _ = setsockopt(sock, sockopt::TcpKeepCount, &3);
    }
}

fn set_nonblocking(fd: &OwnedFd, nonblocking: bool) -> nix::Result<()> {
    let flags = err(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) })?;
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    err(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags) })?;
    Ok(())
}

fn try_connect(addr: SocketAddr, local_port: Option<u16>, timeout: Duration) -> nix::Result<TcpStream> {
    let family = if addr.is_ipv6() {
        AddressFamily::Inet6
    } else {
        AddressFamily::Inet
    };
    let fd = socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)?;
    if let Some(port) = local_port {
        setsockopt(&fd, sockopt::ReuseAddr, &true)?;
        let local: SocketAddr = if addr.is_ipv6() {
            SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), port)
        } else {
            SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), port)
        };
        bind(fd.as_raw_fd(), &SockaddrStorage::from(local))?;
    }

    set_nonblocking(&fd, true)?;
    match connect(fd.as_raw_fd(), &SockaddrStorage::from(addr)) {
        Ok(()) => {}
        Err(Errno::EINPROGRESS) => {
            let mut pfd = [PollFd::new(fd.as_fd(), PollFlags::POLLOUT)];
            let timeout_ms = PollTimeout::try_from(timeout.as_millis() as i32)
                .unwrap_or(PollTimeout::MAX);
            if poll(&mut pfd, timeout_ms)? == 0 {
                return Err(Errno::ETIMEDOUT);
            }
            let so_error = nix::sys::socket::getsockopt(&fd, sockopt::SocketError)?;
            if so_error != 0 {
                return Err(Errno::from_raw(so_error));
            }
        }
        Err(e) => return Err(e),
    }
    set_nonblocking(&fd, false)?;
    Ok(TcpStream::from(fd))
}

/// Opens an outbound connection, drawing the local port from the
/// configured range when one is set. `EADDRINUSE` advances through the
/// range until every port was tried once.
pub fn open_connection(
    host: &str,
    port: u16,
    timeout: Duration,
    range: &mut Option<PortRange>,
) -> Result<TcpStream> {
    let addr = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve {host}:{port}"))?
        .next()
        .ok_or_else(|| anyhow!("cannot resolve {host}:{port}"))?;
    let attempts = range.as_ref().map(|r| r.len()).unwrap_or(1);
    let mut last = Errno::EADDRINUSE;
    for _ in 0..attempts {
        let local_port = range.as_mut().map(|r| r.next_port());
        match try_connect(addr, local_port, timeout) {
            Ok(stream) => return Ok(stream),
            Err(Errno::EADDRINUSE) => {
                last = Errno::EADDRINUSE;
                continue;
            }
            Err(e) => return Err(e).with_context(|| format!("cannot connect to {addr}")),
        }
    }
    Err(anyhow!("cannot connect to {addr}: {last}"))
}

fn make_listener(config: &Config) -> Result<TcpListener> {
    let addrs: Vec<SocketAddr> = (config.listen_addr.as_str(), config.listen_port)
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve listen address {}", config.listen_addr))?
        .collect();
    let addr = if config.disable_ipv6 {
        addrs.iter().find(|a| a.is_ipv4()).copied()
    } else {
        // prefer a dual-stack v6 socket when the address has one
        addrs
            .iter()
            .find(|a| a.is_ipv6())
            .or_else(|| addrs.first())
            .copied()
    }
    .ok_or_else(|| anyhow!("no usable listen address for {}", config.listen_addr))?;

    let family = if addr.is_ipv6() {
        AddressFamily::Inet6
    } else {
        AddressFamily::Inet
    };
    let fd = socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)?;
    setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    if addr.is_ipv6() {
        let _ = setsockopt(&fd, sockopt::Ipv6V6Only, &false);
    }
    bind(fd.as_raw_fd(), &SockaddrStorage::from(addr))
        .with_context(|| format!("cannot bind {addr}"))?;
    nix::sys::socket::listen(&fd, Backlog::new(2)?)?;
    Ok(TcpListener::from(fd))
}

// children are reaped as they finish so no zombies accumulate
extern "C" fn reap_workers(_signal: libc::c_int) {
    loop {
        let pid = unsafe { libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
    }
}

fn install_sigchld_reaper() -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    let action = SigAction::new(
        SigHandler::Handler(reap_workers),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGCHLD, &action)? };
    Ok(())
}

// workers wait for their own children, the shepherd's reaper must not
fn reset_sigchld() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    let _ = unsafe { sigaction(Signal::SIGCHLD, &action) };
}

/// Completes the TLS handshake on an accepted connection and checks the
/// peer certificate subject against the DN allow-list.
fn accept_peer(
    stream: TcpStream,
    tls: &Option<TlsContext>,
    config: &Config,
) -> Result<Box<dyn Channel>> {
    match tls {
        Some(ctx) => {
            let conn = ServerConnection::new(ctx.server.clone())?;
            let mut stream = StreamOwned::new(conn, stream);
            while stream.conn.is_handshaking() {
                stream.conn.complete_io(&mut stream.sock)?;
            }
            tls::verify_peer_dn(config, &stream.conn)?;
            Ok(Box::new(stream))
        }
        None => Ok(Box::new(stream)),
    }
}

/// Opens one callback connection to the orchestrator, TLS-wrapped when
/// TLS is enabled.
fn connect_back(
    peer: IpAddr,
    port: u16,
    tls: &Option<TlsContext>,
    range: &mut Option<PortRange>,
) -> Result<Box<dyn Channel>> {
    let stream = open_connection(&peer.to_string(), port, CALLBACK_TIMEOUT, range)?;
    configure_keepalive(&stream);
    match tls {
        Some(ctx) => {
            let conn: ClientConnection = tls::client_connection(ctx, peer)?;
            let mut stream = StreamOwned::new(conn, stream);
            while stream.conn.is_handshaking() {
                stream.conn.complete_io(&mut stream.sock)?;
            }
            Ok(Box::new(stream))
        }
        None => Ok(Box::new(stream)),
    }
}

fn read_verb_line(channel: &mut dyn Channel) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = channel.read(&mut byte)?;
        if n == 0 || byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > 1024 {
            bail!("oversized control line");
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Splits the `<user>:<groups>` field of a start-forwarding request. The
/// first colon separates the user; the remaining groups stay
/// colon-separated.
pub fn parse_identity_field(field: &str) -> (String, Vec<String>) {
    match field.split_once(':') {
        Some((user, groups)) if !groups.is_empty() => (
            user.to_string(),
            groups.split(':').map(|g| g.to_string()).collect(),
        ),
        _ => (
            field.trim_end_matches(':').to_string(),
            vec!["NONE".to_string()],
        ),
    }
}

enum Verdict {
    Continue,
    Shutdown,
}

/// The accept loop. Returns after a `shutdown` verb; worker children never
/// return from here (they exit the process when their session ends).
pub fn serve(mut config: Config) -> Result<()> {
    let tls = tls::build(&config)?;
    config.production_readiness_check();
    install_sigchld_reaper()?;
    let listener = make_listener(&config)?;
    info!(
        "listening on {}:{}",
        config.listen_addr, config.listen_port
    );

    let mut range = config.local_portrange.map(PortRange::new);
    let mut worker_id: u64 = 1;

    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::Interrupted {
                    info!("error waiting for new connection: {e}");
                }
                continue;
            }
        };
        let peer_ip = peer.ip();
        if let Err(e) = tls::verify_peer_ip(&config, peer_ip) {
            info!("error verifying connection from {peer_ip}: {e}");
            continue;
        }
        configure_keepalive(&stream);
        let mut channel = match accept_peer(stream, &tls, &config) {
            Ok(channel) => channel,
            Err(e) => {
                info!("error verifying connection from {peer_ip}: {e:#}");
                continue;
            }
        };
        let line = match read_verb_line(channel.as_mut()) {
            Ok(line) => line,
            Err(e) => {
                info!("error reading from orchestrator: {e}");
                continue;
            }
        };
        debug!("control message from {peer_ip}: {line}");

        match handle_control(
            &line, peer_ip, channel, &listener, &tls, &mut config, &mut range, &mut worker_id,
        ) {
            Ok(Verdict::Continue) => {}
            Ok(Verdict::Shutdown) => {
                info!("received shutdown message, exiting");
                return Ok(());
            }
            Err(e) => info!("error communicating with orchestrator: {e:#}"),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_control(
    line: &str,
    peer_ip: IpAddr,
    mut channel: Box<dyn Channel>,
    listener: &TcpListener,
    tls: &Option<TlsContext>,
    config: &mut Config,
    range: &mut Option<PortRange>,
    worker_id: &mut u64,
) -> Result<Verdict> {
    let mut words = line.split_whitespace();
    match words.next() {
        Some("shutdown") => Ok(Verdict::Shutdown),
        Some("set") => {
            match (words.next(), words.next()) {
                (Some(key), Some(value)) => config.set_setting(key, value),
                _ => warn!("malformed set command"),
            }
            Ok(Verdict::Continue)
        }
        Some("newtsiprocess") => {
            let port: Option<u16> = words.next().and_then(|w| w.parse().ok());
            let port = config
                .unicorex_port_override
                .or(port)
                .ok_or_else(|| anyhow!("received invalid message"))?;
            channel.write_all(b"OK\n")?;
            channel.flush()?;
            info!("accepted connection from {peer_ip}, contacting port {port}");
            // the orchestrator needs a moment to start listening
            std::thread::sleep(Duration::from_secs(1));
            let command = connect_back(peer_ip, port, tls, range)?;
            let data = connect_back(peer_ip, port, tls, range)?;
            info!("connection to orchestrator at {peer_ip}:{port} established");

            // SAFETY: the shepherd is single threaded
            match unsafe { fork()? } {
                ForkResult::Child => {
                    drop(channel);
                    // the child serves exactly one session
                    let _ = err(unsafe { libc::close(listener.as_raw_fd()) });
                    reset_sigchld();
                    info!("tsi worker {worker_id} started");
                    let mut connector = SocketConnector::new(command, data);
                    let code = match dispatch::process(&mut connector, config.clone(), false) {
                        Ok(()) => 0,
                        Err(e) => {
                            error!("worker failed: {e:#}");
                            1
                        }
                    };
                    std::process::exit(code);
                }
                ForkResult::Parent { child } => {
                    debug!("forked worker {child}");
                    *worker_id += 1;
                    Ok(Verdict::Continue)
                }
            }
        }
        Some("start-forwarding") => {
            let port: Option<u16> = words.next().and_then(|w| w.parse().ok());
            let target = words.next();
            let identity = words.next();
            let (Some(port), Some(target), Some(identity)) = (
                config.unicorex_port_override.or(port),
                target,
                identity,
            ) else {
                bail!("received invalid forwarding request");
            };
            channel.write_all(b"OK\n")?;
            channel.flush()?;
            std::thread::sleep(Duration::from_secs(1));
            let client = open_connection(&peer_ip.to_string(), port, CALLBACK_TIMEOUT, range)?;
            configure_keepalive(&client);

            let (user, groups) = parse_identity_field(identity);
            let message = format!(
                "#TSI_FORWARDING_CONNECT_TO {target}\n#TSI_IDENTITY {user} {}\n",
                groups.join(":")
            );

            // SAFETY: the shepherd is single threaded
            match unsafe { fork()? } {
                ForkResult::Child => {
                    drop(channel);
                    let _ = err(unsafe { libc::close(listener.as_raw_fd()) });
                    reset_sigchld();
                    let config = config.clone();
                    let mut cache = crate::cache::UserCache::new(
                        config.user_cache_ttl,
                        config.use_id_to_resolve_gids,
                    );
                    let mut switch = match UserSwitch::initialize(HostOs, &config) {
                        Ok(s) => s,
                        Err(e) => {
                            error!("cannot initialize identity switch: {e}");
                            std::process::exit(1);
                        }
                    };
                    let group_refs: Vec<&str> = groups.iter().map(String::as_str).collect();
                    if let Err(e) = switch.become_user(&user, &group_refs, &mut cache, &config) {
                        error!("cannot assume identity of {user}: {e}");
                        std::process::exit(1);
                    }
                    forward::run(client, &message, &config);
                }
                ForkResult::Parent { child } => {
                    debug!("forked forwarding worker {child}");
                    Ok(Verdict::Continue)
                }
            }
        }
        other => {
            info!("unknown command: {other:?}");
            Ok(Verdict::Continue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_round_robin() {
        let mut range = PortRange::new((50000, 50002));
        assert_eq!(range.len(), 3);
        assert_eq!(range.next_port(), 50000);
        assert_eq!(range.next_port(), 50001);
        assert_eq!(range.next_port(), 50002);
        assert_eq!(range.next_port(), 50000);
    }

    #[test]
    fn identity_field_parsing() {
        assert_eq!(
            parse_identity_field("alice:staff:wheel"),
            ("alice".to_string(), vec!["staff".to_string(), "wheel".to_string()])
        );
        assert_eq!(
            parse_identity_field("alice"),
            ("alice".to_string(), vec!["NONE".to_string()])
        );
        assert_eq!(
            parse_identity_field("alice:"),
            ("alice".to_string(), vec!["NONE".to_string()])
        );
    }

    #[test]
    fn connect_with_local_port_range() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut range = Some(PortRange::new((48100, 48120)));
        let stream =
            open_connection("127.0.0.1", addr.port(), Duration::from_secs(5), &mut range).unwrap();
        let local = stream.local_addr().unwrap().port();
        assert!((48100..=48120).contains(&local), "{local}");
    }

    #[test]
    fn connect_timeout_fires() {
        // 192.0.2.0/24 is reserved for documentation and never routed
        let result = open_connection("192.0.2.1", 9, Duration::from_millis(200), &mut None);
        assert!(result.is_err());
    }
}
