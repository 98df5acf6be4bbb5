//! TCP forwarding worker.
//!
//! Copies bytes in both directions between the orchestrator-side socket
//! and a backend service, one thread per direction. Each direction is rate
//! limited independently when a limit is configured: whenever the
//! instantaneous transfer rate is above the limit the sleep interval grows
//! by 5 ms and is slept, and it halves again while the rate is below.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tracing::{error, info};

use crate::config::Config;
use crate::msg::extract_parameter;
use crate::shepherd::{configure_keepalive, open_connection, PortRange};

const CHUNK: usize = 4096;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Either side of a forwarding session.
pub enum Sock {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Sock {
    fn try_clone(&self) -> std::io::Result<Sock> {
        Ok(match self {
            Sock::Tcp(s) => Sock::Tcp(s.try_clone()?),
            Sock::Unix(s) => Sock::Unix(s.try_clone()?),
        })
    }

    fn shutdown(&self) {
        let _ = match self {
            Sock::Tcp(s) => s.shutdown(Shutdown::Both),
            Sock::Unix(s) => s.shutdown(Shutdown::Both),
        };
    }

    fn describe(&self) -> String {
        match self {
            Sock::Tcp(s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp peer".to_string()),
            Sock::Unix(s) => s
                .peer_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "unix peer".to_string()),
        }
    }
}

impl Read for Sock {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Sock::Tcp(s) => s.read(buf),
            Sock::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Sock {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Sock::Tcp(s) => s.write(buf),
            Sock::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Sock::Tcp(s) => s.flush(),
            Sock::Unix(s) => s.flush(),
        }
    }
}

/// Grows or shrinks the per-direction sleep interval from the
/// instantaneous rate. Returns the new interval and whether to sleep it.
fn next_sleep_ms(total: u64, elapsed_ms: u64, rate_limit: u64, sleep_ms: u64) -> (u64, bool) {
    let current_rate = 1000 * total / (elapsed_ms + 1);
    if current_rate < rate_limit {
        (sleep_ms / 2, false)
    } else {
        (sleep_ms + 5, true)
    }
}

fn transfer(mut source: Sock, mut destination: Sock, rate_limit: u64) {
    let desc = format!("{} --> {}", source.describe(), destination.describe());
    let started = Instant::now();
    let mut total: u64 = 0;
    let mut sleep_ms: u64 = 0;
    let mut buf = [0u8; CHUNK];
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if destination.write_all(&buf[..n]).is_err() {
            break;
        }
        total += n as u64;
        if rate_limit > 0 {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let (next, throttle) = next_sleep_ms(total, elapsed_ms, rate_limit, sleep_ms);
            sleep_ms = next;
            if throttle {
                std::thread::sleep(Duration::from_millis(sleep_ms));
            }
        }
    }
    info!("stopping forwarding {desc} after {total} bytes");
    source.shutdown();
    destination.shutdown();
}

fn connect_service(service: &str, range: &mut Option<PortRange>) -> Result<Sock> {
    if let Some(socket_file) = service.strip_prefix("file:") {
        info!("connecting to unix domain socket {socket_file}");
        return Ok(Sock::Unix(
            UnixStream::connect(socket_file)
                .with_context(|| format!("cannot connect to {socket_file}"))?,
        ));
    }
    let (host, port) = service
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("service must be host:port or file:/path, got '{service}'"))?;
    let port: u16 = port.parse().with_context(|| format!("bad port in '{service}'"))?;
    info!("connecting to {host}:{port}");
    let stream = open_connection(host, port, CONNECT_TIMEOUT, range)?;
    configure_keepalive(&stream);
    Ok(Sock::Tcp(stream))
}

/// Runs a forwarding session until either side closes, then exits the
/// worker process. The synthetic message carries the target in
/// `#TSI_FORWARDING_CONNECT_TO`.
pub fn run(client: TcpStream, message: &str, config: &Config) -> ! {
    let mut range = config.local_portrange.map(PortRange::new);
    let service = match extract_parameter(message, "FORWARDING_CONNECT_TO") {
        Some(s) => s,
        None => {
            error!("no service to connect to");
            std::process::exit(1);
        }
    };
    let service = match connect_service(service, &mut range) {
        Ok(s) => s,
        Err(e) => {
            error!("cannot reach forwarding target: {e:#}");
            std::process::exit(1);
        }
    };
    let rate_limit = config.port_forwarding_rate_limit;
    if rate_limit > 0 {
        info!(
            "starting forwarding (max. {} kB/sec)",
            rate_limit / 1024
        );
    } else {
        info!("starting forwarding");
    }

    let client = Sock::Tcp(client);
    let (c2, s2) = match (client.try_clone(), service.try_clone()) {
        (Ok(c), Ok(s)) => (c, s),
        _ => {
            error!("cannot clone forwarding sockets");
            std::process::exit(1);
        }
    };
    let up = std::thread::spawn(move || transfer(client, service, rate_limit));
    let down = std::thread::spawn(move || transfer(s2, c2, rate_limit));
    let _ = up.join();
    let _ = down.join();
    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn sleep_interval_grows_above_the_limit_and_halves_below() {
        // 1000 bytes in ~1 ms is far above a 100 B/s limit
        assert_eq!(next_sleep_ms(1000, 1, 100, 0), (5, true));
        assert_eq!(next_sleep_ms(1000, 1, 100, 5), (10, true));
        // once enough time has passed the rate is below the limit
        assert_eq!(next_sleep_ms(10, 1000, 100, 10), (5, false));
    }

    #[test]
    fn rate_limited_transfer_is_bounded() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let payload = vec![7u8; 64 * 1024];
        let expected = payload.clone();

        let sender = std::thread::spawn(move || {
            let mut s = TcpStream::connect(addr).unwrap();
            s.write_all(&payload).unwrap();
        });
        let (src, _) = listener.accept().unwrap();

        let sink_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let sink_addr = sink_listener.local_addr().unwrap();
        let receiver = std::thread::spawn(move || {
            let (mut s, _) = sink_listener.accept().unwrap();
            let mut data = Vec::new();
            s.read_to_end(&mut data).unwrap();
            data
        });
        let dst = TcpStream::connect(sink_addr).unwrap();

        let rate = 1024 * 1024; // 1 MB/s
        let started = Instant::now();
        transfer(Sock::Tcp(src), Sock::Tcp(dst), rate);
        let elapsed = started.elapsed().as_secs_f64();

        sender.join().unwrap();
        let data = receiver.join().unwrap();
        assert_eq!(data, expected);
        // 64 KiB at 1 MB/s must not finish instantly
        let observed_rate = data.len() as f64 / elapsed.max(0.001);
        assert!(
            observed_rate <= rate as f64 * 1.5,
            "rate {observed_rate} exceeds limit"
        );
    }

    #[test]
    fn service_target_parsing_rejects_garbage() {
        let mut range = None;
        assert!(connect_service("no-port-here", &mut range).is_err());
        assert!(connect_service("host:notaport", &mut range).is_err());
    }
}
