//! UFTP-assisted transfers.
//!
//! The worker does not stream the file itself; it forks a detached helper
//! under the requested identity that logs in to the UFTP server with a
//! one-time secret and performs the RETR or STOR. The helper's pid and
//! exit status land in files inside the job directory so the orchestrator
//! can poll for completion.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use nix::unistd::{fork, setsid, ForkResult};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::connector::Connector;
use crate::msg::{expand_variables, extract_parameter, parameter_or};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Get,
    Put,
}

struct Transfer {
    host: String,
    port: u16,
    secret: String,
    operation: Operation,
    partial: bool,
    remote: String,
    local: String,
    offset: u64,
    length: i64,
}

fn parse_transfer(message: &str) -> Result<Transfer> {
    let host = extract_parameter(message, "UFTP_HOST")
        .ok_or_else(|| anyhow!("missing TSI_UFTP_HOST"))?;
    let port: u16 = extract_parameter(message, "UFTP_PORT")
        .ok_or_else(|| anyhow!("missing TSI_UFTP_PORT"))?
        .parse()
        .context("bad TSI_UFTP_PORT")?;
    let secret = extract_parameter(message, "UFTP_SECRET")
        .ok_or_else(|| anyhow!("missing TSI_UFTP_SECRET"))?;
    let operation = match parameter_or(message, "UFTP_OPERATION", "GET") {
        "GET" => Operation::Get,
        "PUT" => Operation::Put,
        other => bail!("unknown UFTP operation '{other}'"),
    };
    let partial = parameter_or(message, "UFTP_WRITE_MODE", "FULL") == "PARTIAL";
    let remote = expand_variables(
        extract_parameter(message, "UFTP_REMOTE_FILE")
            .ok_or_else(|| anyhow!("missing TSI_UFTP_REMOTE_FILE"))?,
    );
    let local = expand_variables(
        extract_parameter(message, "UFTP_LOCAL_FILE")
            .ok_or_else(|| anyhow!("missing TSI_UFTP_LOCAL_FILE"))?,
    );
    let mut offset = crate::msg::extract_number(message, "UFTP_OFFSET").max(0) as u64;
    let length = crate::msg::extract_number(message, "UFTP_LENGTH");
    if length < 0 && !partial {
        // no range requested, transfer from the top
        offset = 0;
    }
    Ok(Transfer {
        host: host.to_string(),
        port,
        secret: secret.to_string(),
        operation,
        partial,
        remote,
        local,
        offset,
        length,
    })
}

/// Minimal FTP control-channel client, just enough for the UFTP dialog:
/// anonymous login with the secret as password, binary type, passive data
/// connections and an optional byte range.
struct FtpClient {
    control: BufReader<TcpStream>,
}

impl FtpClient {
    fn connect(host: &str, port: u16) -> Result<Self> {
        use std::net::ToSocketAddrs;
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow!("cannot resolve {host}:{port}"))?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .with_context(|| format!("cannot connect to {host}:{port}"))?;
        let mut client = Self {
            control: BufReader::new(stream),
        };
        let greeting = client.read_reply()?;
        info!("connected to UFTPD: {}", greeting.1);
        Ok(client)
    }

    fn read_reply(&mut self) -> Result<(u16, String)> {
        let mut text = String::new();
        loop {
            let mut line = String::new();
            if self.control.read_line(&mut line)? == 0 {
                bail!("control connection closed");
            }
            let done = line.len() >= 4 && line.as_bytes()[3] == b' ';
            text.push_str(&line);
            if done {
                let code: u16 = line[..3].parse().context("malformed FTP reply")?;
                return Ok((code, text.trim_end().to_string()));
            }
        }
    }

    fn command(&mut self, cmd: &str) -> Result<(u16, String)> {
        debug!(">> {cmd}");
        let stream = self.control.get_mut();
        stream.write_all(cmd.as_bytes())?;
        stream.write_all(b"\r\n")?;
        stream.flush()?;
        let reply = self.read_reply()?;
        debug!("<< {}", reply.1);
        Ok(reply)
    }

    fn expect(&mut self, cmd: &str, ok: &[u16]) -> Result<(u16, String)> {
        let (code, text) = self.command(cmd)?;
        if !ok.contains(&code) {
            bail!("'{cmd}' rejected: {text}");
        }
        Ok((code, text))
    }

    fn login(&mut self, secret: &str) -> Result<()> {
        let (code, _) = self.expect("USER anonymous", &[230, 331])?;
        if code == 331 {
            self.expect(&format!("PASS {secret}"), &[230])?;
        }
        self.expect("TYPE I", &[200])?;
        Ok(())
    }

    fn range(&mut self, offset: u64, length: i64) -> Result<()> {
        self.expect(&format!("RANG {offset} {length}"), &[200, 350])?;
        Ok(())
    }

    /// `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`
    fn passive(&mut self) -> Result<TcpStream> {
        let (_, text) = self.expect("PASV", &[227])?;
        let (addr, port) = parse_pasv_reply(&text)?;
        TcpStream::connect_timeout(
            &std::net::SocketAddr::new(addr.into(), port),
            CONNECT_TIMEOUT,
        )
        .with_context(|| format!("cannot open data connection to {addr}:{port}"))
    }

    fn retrieve(&mut self, remote: &str, sink: &mut impl Write, length: i64) -> Result<u64> {
        let mut data = self.passive()?;
        self.expect(&format!("RETR {remote}"), &[125, 150])?;
        let copied = if length >= 0 {
            std::io::copy(&mut Read::take(&mut data, length as u64), sink)?
        } else {
            std::io::copy(&mut data, sink)?
        };
        drop(data);
        self.read_reply()?;
        Ok(copied)
    }

    fn store(&mut self, remote: &str, source: &mut impl Read, length: i64) -> Result<u64> {
        let mut data = self.passive()?;
        self.expect(&format!("STOR {remote}"), &[125, 150])?;
        let copied = if length >= 0 {
            std::io::copy(&mut Read::take(source, length as u64), &mut data)?
        } else {
            std::io::copy(source, &mut data)?
        };
        drop(data);
        self.read_reply()?;
        Ok(copied)
    }

    fn quit(&mut self) {
        let _ = self.command("QUIT");
    }
}

fn parse_pasv_reply(text: &str) -> Result<(std::net::Ipv4Addr, u16)> {
    let open = text.find('(').ok_or_else(|| anyhow!("malformed PASV reply: {text}"))?;
    let close = text[open..]
        .find(')')
        .ok_or_else(|| anyhow!("malformed PASV reply: {text}"))?;
    let numbers: Vec<u16> = text[open + 1..open + close]
        .split(',')
        .map(|n| n.trim().parse::<u16>())
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("malformed PASV reply: {text}"))?;
    if numbers.len() != 6 || numbers[..4].iter().any(|&n| n > 255) {
        bail!("malformed PASV reply: {text}");
    }
    let addr = std::net::Ipv4Addr::new(
        numbers[0] as u8,
        numbers[1] as u8,
        numbers[2] as u8,
        numbers[3] as u8,
    );
    Ok((addr, numbers[4] * 256 + numbers[5]))
}

fn run_transfer(t: &Transfer) -> Result<()> {
    let mut ftp = FtpClient::connect(&t.host, t.port)?;
    ftp.login(&t.secret)?;
    let ranged = t.offset > 0 || t.length >= 0;
    if ranged {
        ftp.range(t.offset, t.length)?;
    }
    match t.operation {
        Operation::Get => {
            info!("GET {} -> {}", t.remote, t.local);
            let mut file = if t.partial {
                let mut f = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&t.local)
                    .with_context(|| format!("cannot open {}", t.local))?;
                f.seek(SeekFrom::Start(t.offset))?;
                f
            } else {
                File::create(&t.local).with_context(|| format!("cannot create {}", t.local))?
            };
            ftp.retrieve(&t.remote, &mut file, t.length)?;
        }
        Operation::Put => {
            info!("PUT {} -> {}", t.local, t.remote);
            let mut file =
                File::open(&t.local).with_context(|| format!("cannot open {}", t.local))?;
            if t.partial {
                file.seek(SeekFrom::Start(t.offset))?;
            }
            ftp.store(&t.remote, &mut file, t.length)?;
        }
    }
    ftp.quit();
    Ok(())
}

/// Handles the TSI_UFTP verb: forks the detached transfer helper, records
/// its pid, and acknowledges the request immediately.
pub fn uftp(message: &str, connector: &mut dyn Connector, _config: &Config) -> Result<()> {
    let message = expand_variables(message);
    let transfer = parse_transfer(&message)?;
    let uspace_dir = parameter_or(&message, "USPACE_DIR", ".");
    std::env::set_current_dir(uspace_dir)
        .with_context(|| format!("cannot enter job directory {uspace_dir}"))?;
    let stdout_file = parameter_or(&message, "STDOUT", "stdout");
    let pid_file = parameter_or(&message, "PID_FILE", "UNICORE_SCRIPT_PID");
    let exit_code_file = parameter_or(&message, "EXIT_CODE_FILE", "UNICORE_SCRIPT_EXIT_CODE");

    // SAFETY: the worker is single threaded at this point
    match unsafe { fork()? } {
        ForkResult::Parent { child } => {
            std::fs::write(pid_file, format!("{child}\n"))
                .with_context(|| format!("cannot write {pid_file}"))?;
            connector.ok(None)?;
            Ok(())
        }
        ForkResult::Child => {
            let _ = setsid();
            // helper output goes to the job's log file
            if let Ok(log) = File::create(stdout_file) {
                use std::os::fd::AsRawFd;
                let _ = crate::err(unsafe { libc::dup2(log.as_raw_fd(), libc::STDOUT_FILENO) });
                let _ = crate::err(unsafe { libc::dup2(log.as_raw_fd(), libc::STDERR_FILENO) });
            }
            let status = match run_transfer(&transfer) {
                Ok(()) => 0,
                Err(e) => {
                    error!("UFTP transfer failed: {e:#}");
                    1
                }
            };
            let _ = std::fs::write(exit_code_file, format!("{status}\n"));
            unsafe { libc::_exit(status) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSG: &str = "#TSI_UFTP\n\
#TSI_UFTP_HOST uftpd.example\n\
#TSI_UFTP_PORT 64434\n\
#TSI_UFTP_SECRET s3cret\n\
#TSI_UFTP_OPERATION GET\n\
#TSI_UFTP_WRITE_MODE PARTIAL\n\
#TSI_UFTP_REMOTE_FILE /data/in\n\
#TSI_UFTP_LOCAL_FILE /work/out\n\
#TSI_UFTP_OFFSET 1024\n\
#TSI_UFTP_LENGTH 2048\n";

    #[test]
    fn transfer_parameters_parse() {
        let t = parse_transfer(MSG).unwrap();
        assert_eq!(t.host, "uftpd.example");
        assert_eq!(t.port, 64434);
        assert_eq!(t.operation, Operation::Get);
        assert!(t.partial);
        assert_eq!(t.offset, 1024);
        assert_eq!(t.length, 2048);
    }

    #[test]
    fn full_mode_without_length_resets_the_offset() {
        let msg = "#TSI_UFTP\n#TSI_UFTP_HOST h\n#TSI_UFTP_PORT 21\n#TSI_UFTP_SECRET x\n\
                   #TSI_UFTP_OPERATION PUT\n#TSI_UFTP_REMOTE_FILE r\n#TSI_UFTP_LOCAL_FILE l\n\
                   #TSI_UFTP_OFFSET 4096\n";
        let t = parse_transfer(msg).unwrap();
        assert_eq!(t.offset, 0);
        assert_eq!(t.length, -1);
    }

    #[test]
    fn missing_required_parameters_fail() {
        assert!(parse_transfer("#TSI_UFTP\n#TSI_UFTP_PORT 21\n").is_err());
    }

    #[test]
    fn pasv_reply_parses() {
        let (addr, port) =
            parse_pasv_reply("227 Entering Passive Mode (192,168,1,9,197,143)").unwrap();
        assert_eq!(addr, std::net::Ipv4Addr::new(192, 168, 1, 9));
        assert_eq!(port, 197 * 256 + 143);
        assert!(parse_pasv_reply("227 whatever").is_err());
        assert!(parse_pasv_reply("227 (1,2,3)").is_err());
    }
}
