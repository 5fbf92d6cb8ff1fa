// This file is part of jgwd, the journal gateway daemon
// Copyright (C) 2023 Pengutronix e.K.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this library; if not, see <https://www.gnu.org/licenses/>.

use std::io::Result;

use async_std::task::spawn_blocking;
use serde::Serialize;
use tide::http::Body;
use tide::{Request, Response, Server};

use crate::entries::open_journal;
use crate::error::GatewayError;

// The host probes use the same backend split as the journal itself:
// builds with the "systemd" feature ask the running system, everything
// else (tests included) reports stable demo values that agree with the
// in-memory journal store.

#[cfg(any(test, not(feature = "systemd")))]
mod probes {
    use std::io::Result;

    use crate::journal::memory::DEMO_BOOT_ID;

    pub const DEMO_MACHINE_ID: &str = "ad1f2b3c4d5e6f708192a3b4c5d6e7f8";

    pub fn machine_id() -> Result<String> {
        Ok(DEMO_MACHINE_ID.to_string())
    }

    pub fn boot_id() -> Result<String> {
        Ok(DEMO_BOOT_ID.to_string())
    }

    pub fn hostname() -> String {
        "demo".to_string()
    }

    pub fn os_pretty_name() -> String {
        "Demo Linux".to_string()
    }

    pub fn virtualization() -> String {
        "bare".to_string()
    }
}

#[cfg(all(feature = "systemd", not(test)))]
mod probes {
    use std::fs::read_to_string;
    use std::io::{Error, ErrorKind, Result};

    use nix::sys::utsname::uname;

    pub fn machine_id() -> Result<String> {
        read_id128("/etc/machine-id", false)
    }

    pub fn boot_id() -> Result<String> {
        // The kernel hands this out with dashes, the journal stores it
        // without them.
        read_id128("/proc/sys/kernel/random/boot_id", true)
    }

    fn read_id128(path: &str, dashed: bool) -> Result<String> {
        let raw = read_to_string(path)?;
        let id: String = if dashed {
            raw.trim().chars().filter(|c| *c != '-').collect()
        } else {
            raw.trim().to_string()
        };

        if id.len() != 32 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("{path} does not contain a valid 128 bit id"),
            ));
        }

        Ok(id.to_ascii_lowercase())
    }

    pub fn hostname() -> String {
        uname()
            .ok()
            .and_then(|uts| uts.nodename().to_str().map(super::hostname_cleanup))
            .filter(|hostname| !hostname.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }

    pub fn os_pretty_name() -> String {
        ["/etc/os-release", "/usr/lib/os-release"]
            .iter()
            .filter_map(|path| read_to_string(path).ok())
            .find_map(|content| super::parse_os_release(&content))
            .unwrap_or_else(|| "Linux".to_string())
    }

    pub fn virtualization() -> String {
        read_to_string("/run/systemd/container")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "bare".to_string())
    }
}

pub fn boot_id() -> Result<String> {
    probes::boot_id()
}

/// The document served on /machine. Numbers are serialized as decimal
/// strings on purpose, that is the wire contract.
#[derive(Serialize)]
struct MachineInfo {
    machine_id: String,
    boot_id: String,
    hostname: String,
    os_pretty_name: String,
    virtualization: String,
    usage: String,
    cutoff_from_realtime: String,
    cutoff_to_realtime: String,
}

pub fn serve(server: &mut Server<()>) {
    server.at("/machine").get(machine_response);
}

async fn machine_response(_req: Request<()>) -> tide::Result {
    // The journal numbers come from a thread-bound handle.
    let info = spawn_blocking(collect).await;

    let info = match info {
        Ok(info) => info,
        Err(e) => return Ok(e.into_response()),
    };

    let resp = Response::builder(200)
        .body(Body::from_json(&info)?)
        .content_type("application/json")
        .build();

    Ok(resp)
}

fn collect() -> std::result::Result<MachineInfo, GatewayError> {
    let mut journal = open_journal()?;

    let usage = journal
        .usage()
        .map_err(|e| GatewayError::Server(format!("Failed to determine journal usage: {e}")))?;
    let (cutoff_from, cutoff_to) = journal
        .cutoff_realtime()
        .map_err(|e| GatewayError::Server(format!("Failed to determine journal cutoff: {e}")))?;

    let machine_id = probes::machine_id()
        .map_err(|e| GatewayError::Server(format!("Failed to determine machine id: {e}")))?;
    let boot_id = probes::boot_id()
        .map_err(|e| GatewayError::Server(format!("Failed to determine boot id: {e}")))?;

    Ok(MachineInfo {
        machine_id,
        boot_id,
        hostname: probes::hostname(),
        os_pretty_name: probes::os_pretty_name(),
        virtualization: probes::virtualization(),
        usage: usage.to_string(),
        cutoff_from_realtime: cutoff_from.to_string(),
        cutoff_to_realtime: cutoff_to.to_string(),
    })
}

/// Extract PRETTY_NAME from os-release(5) content.
#[cfg(any(test, feature = "systemd"))]
pub(crate) fn parse_os_release(content: &str) -> Option<String> {
    for line in content.lines() {
        let line = line.trim();

        if let Some(value) = line.strip_prefix("PRETTY_NAME=") {
            let value = value.trim();

            let unquoted = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .map(|v| v.replace("\\\"", "\"").replace("\\\\", "\\"))
                .unwrap_or_else(|| value.to_string());

            if !unquoted.is_empty() {
                return Some(unquoted);
            }
        }
    }

    None
}

/// Keep only the characters a hostname may contain and strip stray dots,
/// so a half-broken nodename does not leak into the machine document.
#[cfg(any(test, feature = "systemd"))]
pub(crate) fn hostname_cleanup(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::fs::write;

    use super::{hostname_cleanup, parse_os_release};

    #[test]
    fn os_release_pretty_name() {
        let content = "NAME=\"Debian GNU/Linux\"\nPRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\nID=debian\n";
        assert_eq!(
            parse_os_release(content).as_deref(),
            Some("Debian GNU/Linux 12 (bookworm)")
        );

        // Unquoted values and escapes are legal per os-release(5).
        assert_eq!(
            parse_os_release("PRETTY_NAME=Linux\n").as_deref(),
            Some("Linux")
        );
        assert_eq!(
            parse_os_release("PRETTY_NAME=\"My \\\"Distro\\\"\"\n").as_deref(),
            Some("My \"Distro\"")
        );

        assert_eq!(parse_os_release("ID=debian\n"), None);
        assert_eq!(parse_os_release("PRETTY_NAME=\"\"\n"), None);
    }

    #[test]
    fn os_release_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("os-release");
        write(&path, "PRETTY_NAME=\"Test OS 1.0\"\n").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(parse_os_release(&content).as_deref(), Some("Test OS 1.0"));
    }

    #[test]
    fn hostname_cleanup_strips_garbage() {
        assert_eq!(hostname_cleanup("demo"), "demo");
        assert_eq!(hostname_cleanup(" demo.example.com.\n"), "demo.example.com");
        assert_eq!(hostname_cleanup("web_01!"), "web01");
    }
}
