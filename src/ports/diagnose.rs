// Port holder diagnostics
// Maps a TCP port to the processes holding sockets on it via procfs (Linux only)

use std::collections::HashSet;
use std::fmt;

/// One process found holding a socket on the port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortHolder {
    pub pid: u32,
    pub command: String,
}

/// Point-in-time view of a port for operators
#[derive(Debug, Clone, Default)]
pub struct PortDiagnosis {
    pub port: u16,

    /// Kernel socket states seen on the port (e.g. Listen, TimeWait)
    pub socket_states: Vec<String>,

    pub holders: Vec<PortHolder>,
}

impl PortDiagnosis {
    pub fn is_empty(&self) -> bool {
        self.holders.is_empty() && self.socket_states.is_empty()
    }
}

impl fmt::Display for PortDiagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "port {}: no sockets found", self.port);
        }

        write!(f, "port {}: states [{}]", self.port, self.socket_states.join(", "))?;
        for holder in &self.holders {
            write!(f, " pid={} ({})", holder.pid, holder.command)?;
        }
        Ok(())
    }
}

/// Collect what the kernel knows about `port`. Returns an empty diagnosis
/// when /proc is unavailable; never fails.
#[cfg(target_os = "linux")]
pub fn inspect(port: u16) -> PortDiagnosis {
    let mut diagnosis = PortDiagnosis {
        port,
        ..Default::default()
    };

    let entries = procfs::net::tcp()
        .into_iter()
        .chain(procfs::net::tcp6())
        .flatten()
        .filter(|entry| entry.local_address.port() == port);

    let mut inodes = HashSet::new();
    for entry in entries {
        let state = format!("{:?}", entry.state);
        if !diagnosis.socket_states.contains(&state) {
            diagnosis.socket_states.push(state);
        }
        // Sockets in TIME_WAIT have no owner (inode 0)
        if entry.inode != 0 {
            inodes.insert(entry.inode);
        }
    }

    if !inodes.is_empty() {
        diagnosis.holders = holders_of(&inodes);
    }
    diagnosis
}

#[cfg(not(target_os = "linux"))]
pub fn inspect(port: u16) -> PortDiagnosis {
    PortDiagnosis {
        port,
        ..Default::default()
    }
}

#[cfg(target_os = "linux")]
fn holders_of(inodes: &HashSet<u64>) -> Vec<PortHolder> {
    use procfs::process::FDTarget;

    let Ok(processes) = procfs::process::all_processes() else {
        return Vec::new();
    };

    processes
        .flatten()
        .filter(|process| {
            // Processes we may not inspect (other users) are skipped
            process.fd().map_or(false, |fds| {
                fds.flatten()
                    .any(|fd| matches!(fd.target, FDTarget::Socket(inode) if inodes.contains(&inode)))
            })
        })
        .map(|process| PortHolder {
            pid: process.pid() as u32,
            command: process
                .stat()
                .map(|stat| stat.comm)
                .unwrap_or_else(|_| "?".to_string()),
        })
        .collect()
}
