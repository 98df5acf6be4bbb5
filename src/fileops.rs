//! File I/O operations: chunked reads and writes, directory listings and
//! free-space reporting.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use nix::unistd::{access, AccessFlags};
use regex::Regex;
use tracing::debug;

use crate::cache::{name_of_gid, name_of_uid};
use crate::config::Config;
use crate::connector::Connector;
use crate::msg::{expand_variables, extract_number, extract_parameter, run_command};

/// Streams part of a file to the data channel. The reply announces the
/// number of bytes actually read, which can be less than requested at end
/// of file.
pub fn get_file_chunk(message: &str, connector: &mut dyn Connector) -> Result<()> {
    let path = extract_parameter(message, "FILE").ok_or_else(|| anyhow!("missing TSI_FILE"))?;
    let path = expand_variables(path);
    let start = extract_number(message, "START").max(0) as u64;
    let length = extract_number(message, "LENGTH").max(0) as usize;
    debug!("getting data from {path} start at {start} length {length}");

    let mut file = File::open(&path).with_context(|| format!("cannot open {path}"))?;
    if start > 0 {
        // pipes and other special files are not seekable, read from the top
        let _ = file.seek(SeekFrom::Start(start));
    }
    let mut buf = vec![0u8; length];
    let mut total = 0;
    while total < length {
        let n = file
            .read(&mut buf[total..])
            .with_context(|| format!("error reading {path}"))?;
        if n == 0 {
            break;
        }
        total += n;
    }

    connector.ok(Some(&format!("TSI_LENGTH {total}\nENDOFMESSAGE")))?;
    let mut written = 0;
    while written < total {
        written += connector.write_data(&buf[written..total])?;
    }
    Ok(())
}

/// Receives a chunk from the data channel into a file. The TSI_FILE value
/// carries the target path and an octal mode, separated by the last space.
pub fn put_file_chunk(message: &str, connector: &mut dyn Connector) -> Result<()> {
    let path_and_mode =
        extract_parameter(message, "FILE").ok_or_else(|| anyhow!("missing TSI_FILE"))?;
    let (path, mode) = path_and_mode
        .rsplit_once(' ')
        .ok_or_else(|| anyhow!("TSI_FILE must be '<path> <mode>'"))?;
    let path = expand_variables(path);
    let mode = u32::from_str_radix(mode, 8).with_context(|| format!("bad file mode '{mode}'"))?;
    let append = extract_parameter(message, "FILESACTION") == Some("3");
    let length = extract_number(message, "LENGTH").max(0) as usize;
    debug!("writing {length} bytes of data to {path}");

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .append(append)
        .truncate(!append)
        .open(&path)
        .with_context(|| format!("cannot open {path}"))?;

    // tell the peer to start sending
    connector.ok(Some("ENDOFMESSAGE"))?;

    let mut remaining = length;
    while remaining > 0 {
        let buf = connector.read_data(remaining)?;
        if buf.is_empty() {
            bail!("data stream closed with {remaining} bytes outstanding");
        }
        remaining -= buf.len();
        file.write_all(&buf)
            .with_context(|| format!("error writing {path}"))?;
    }
    drop(file);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("cannot chmod {path}"))?;
    Ok(())
}

/// One listing entry: flag characters, size, mtime and path, followed by
/// an extended line with the permission bits and ownership.
fn file_info(path: &str) -> Result<String> {
    let meta = std::fs::metadata(path).with_context(|| format!("stat {path}"))?;
    let mode = meta.permissions().mode();

    let is_dir = if meta.is_dir() { 'D' } else { ' ' };
    let probe = |flag: AccessFlags| access(Path::new(path), flag).is_ok();
    let readable = if probe(AccessFlags::R_OK) { 'R' } else { ' ' };
    let writable = if probe(AccessFlags::W_OK) { 'W' } else { ' ' };
    let executable = if probe(AccessFlags::X_OK) { 'X' } else { ' ' };
    let owned = if nix::unistd::geteuid().as_raw() == meta.uid() {
        'O'
    } else {
        ' '
    };

    let mut perms = String::from("--");
    for (bit, c) in [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'),
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'),
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'),
    ] {
        perms.push(if mode & bit != 0 { c } else { '-' });
    }

    // newline characters would break the line format
    let clean_path: String = path
        .chars()
        .map(|c| if c == '\r' || c == '\n' { '?' } else { c })
        .collect();

    Ok(format!(
        " {}{}{}{}{} {} {} {}\n{} {} {}",
        is_dir,
        readable,
        writable,
        executable,
        owned,
        meta.size(),
        meta.mtime(),
        clean_path,
        perms,
        name_of_uid(meta.uid()),
        name_of_gid(meta.gid()),
    ))
}

fn list_directory(connector: &mut dyn Connector, path: &Path, recursive: bool) -> Result<()> {
    let entries = std::fs::read_dir(path).with_context(|| format!("list {}", path.display()))?;
    for entry in entries.flatten() {
        let full = entry.path();
        if recursive && full.is_dir() {
            list_directory(connector, &full, recursive)?;
            connector.write_message("<")?;
        }
        if let Ok(info) = file_info(&full.to_string_lossy()) {
            connector.write_message(&info)?;
        }
    }
    Ok(())
}

/// Lists a directory or a single file. Mode `A` reports only the target
/// itself, `R` descends recursively, `N` lists one level.
pub fn ls(message: &str, connector: &mut dyn Connector) -> Result<()> {
    let path = extract_parameter(message, "FILE").ok_or_else(|| anyhow!("missing TSI_FILE"))?;
    let path = expand_variables(path);
    let mode = extract_parameter(message, "LS_MODE").unwrap_or("");
    if !matches!(mode, "A" | "R" | "N") {
        bail!("Unknown TSI_LS mode: '{mode}', must be one of 'R', 'A' or 'N'.");
    }
    let as_single_file = mode == "A";
    let recursive = mode == "R";

    connector.write_message("START_LISTING")?;
    let target = Path::new(&path);
    if target.exists() {
        if target.is_dir() && !as_single_file {
            let _ = list_directory(connector, target, recursive);
        } else if let Ok(info) = file_info(&path) {
            connector.write_message(&info)?;
        }
    }
    connector.write_message("END_LISTING")?;
    Ok(())
}

/// Pulls the total and free byte counts out of `df -P -B 1` output.
fn parse_df(output: &str) -> Option<(u64, u64)> {
    let re = Regex::new(r"(\S+)\s+(\d+)\s+(\d+)\s+(\d+).+").unwrap();
    let mut result = None;
    for line in output.lines() {
        if let Some(caps) = re.captures(line) {
            let total = caps.get(2).unwrap().as_str().parse().ok()?;
            let free = caps.get(4).unwrap().as_str().parse().ok()?;
            result = Some((total, free));
        }
    }
    result
}

/// Reports the free space on the partition holding a path. Only a failing
/// `df` command is an error; output without a recognizable data row is
/// reported as unknown (-1).
pub fn df(message: &str, connector: &mut dyn Connector, config: &Config) -> Result<()> {
    let path = extract_parameter(message, "FILE").ok_or_else(|| anyhow!("missing TSI_FILE"))?;
    let path = expand_variables(path);
    let output = run_command(&format!("df -P -B 1 {path}"), config.use_login_shell)?;
    let (total, free) = match parse_df(&output) {
        Some((total, free)) => (total.to_string(), free.to_string()),
        None => ("-1".to_string(), "-1".to_string()),
    };
    connector.write_message("START_DF")?;
    connector.write_message(&format!("TOTAL {total}"))?;
    connector.write_message(&format!("FREE {free}"))?;
    // user quota reporting is not wired up
    connector.write_message("USER -1")?;
    connector.write_message("END_DF")?;
    Ok(())
}
