//! Linux capability management for least-privilege execution.
//!
//! The container init keeps full capabilities through setup, then trims
//! the bounding set, switches credentials with `PR_SET_KEEPCAPS`, and
//! finally installs the requested effective, permitted, inheritable and
//! ambient sets right before `execve`.

use runcell_common::error::IsolationError;
use runcell_spec::container::Capabilities;

/// Capability names indexed by capability number.
pub const CAPABILITY_NAMES: [&str; 41] = [
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_LINUX_IMMUTABLE",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_ADMIN",
    "CAP_NET_RAW",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_SYS_MODULE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_PACCT",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_NICE",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_MKNOD",
    "CAP_LEASE",
    "CAP_AUDIT_WRITE",
    "CAP_AUDIT_CONTROL",
    "CAP_SETFCAP",
    "CAP_MAC_OVERRIDE",
    "CAP_MAC_ADMIN",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
    "CAP_BLOCK_SUSPEND",
    "CAP_AUDIT_READ",
    "CAP_PERFMON",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
];

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// Capability number for a `CAP_*` name.
#[must_use]
pub fn number(name: &str) -> Option<u32> {
    CAPABILITY_NAMES
        .iter()
        .position(|n| *n == name)
        .and_then(|i| u32::try_from(i).ok())
}

/// Highest capability the running kernel knows.
#[must_use]
pub fn last_cap() -> u32 {
    std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(40)
}

/// Capability sets as bit masks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySets {
    /// Bounding set.
    pub bounding: u64,
    /// Effective set.
    pub effective: u64,
    /// Permitted set.
    pub permitted: u64,
    /// Inheritable set.
    pub inheritable: u64,
    /// Ambient set.
    pub ambient: u64,
}

fn mask(names: &[String]) -> u64 {
    names.iter().fold(0, |acc, name| match number(name) {
        Some(n) => acc | (1 << n),
        None => {
            tracing::warn!(capability = %name, "unknown capability ignored");
            acc
        }
    })
}

fn syscall_err(step: &'static str) -> IsolationError {
    IsolationError::Setup {
        step,
        message: std::io::Error::last_os_error().to_string(),
    }
}

impl CapabilitySets {
    /// Builds the masks from the container's capability names.
    ///
    /// Names this runtime does not know are ignored with a warning.
    #[must_use]
    pub fn from_spec(caps: &Capabilities) -> Self {
        Self {
            bounding: mask(&caps.bounding),
            effective: mask(&caps.effective),
            permitted: mask(&caps.permitted),
            inheritable: mask(&caps.inheritable),
            ambient: mask(&caps.ambient),
        }
    }

    /// Removes every capability outside the bounding set.
    ///
    /// Needs `CAP_SETPCAP`, so it runs before credentials change.
    ///
    /// # Errors
    ///
    /// Returns [`IsolationError::Setup`] if `PR_CAPBSET_DROP` fails.
    pub fn drop_bounding(&self) -> Result<(), IsolationError> {
        for cap in 0..=last_cap().min(63) {
            if self.bounding & (1 << cap) != 0 {
                continue;
            }
            // SAFETY: PR_CAPBSET_DROP takes a capability number and no pointers.
            let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, libc::c_ulong::from(cap), 0, 0, 0) };
            if rc != 0 {
                return Err(syscall_err("drop bounding capabilities"));
            }
        }
        Ok(())
    }

    /// Installs the effective, permitted and inheritable sets, then the
    /// ambient set.
    ///
    /// # Errors
    ///
    /// Returns [`IsolationError::Setup`] if `capset(2)` or an ambient
    /// `prctl(2)` fails.
    pub fn apply(&self) -> Result<(), IsolationError> {
        let mut header = CapUserHeader {
            version: LINUX_CAPABILITY_VERSION_3,
            pid: 0,
        };
        let data = [self.split(0), self.split(32)];
        // SAFETY: header and data are valid repr(C) structures of the layout
        // capset(2) expects for version 3; the kernel only reads them.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_capset,
                &raw mut header,
                data.as_ptr(),
            )
        };
        if rc != 0 {
            return Err(syscall_err("capset"));
        }

        // SAFETY: PR_CAP_AMBIENT_CLEAR_ALL takes no pointers.
        let rc = unsafe {
            libc::prctl(
                libc::PR_CAP_AMBIENT,
                libc::PR_CAP_AMBIENT_CLEAR_ALL,
                0,
                0,
                0,
            )
        };
        if rc != 0 {
            return Err(syscall_err("clear ambient capabilities"));
        }
        for cap in 0..64_u32 {
            if self.ambient & (1 << cap) == 0 {
                continue;
            }
            // SAFETY: PR_CAP_AMBIENT_RAISE takes a capability number and no pointers.
            let rc = unsafe {
                libc::prctl(
                    libc::PR_CAP_AMBIENT,
                    libc::PR_CAP_AMBIENT_RAISE,
                    libc::c_ulong::from(cap),
                    0,
                    0,
                )
            };
            if rc != 0 {
                return Err(syscall_err("raise ambient capability"));
            }
        }
        tracing::debug!(
            effective = format_args!("{:#x}", self.effective),
            ambient = format_args!("{:#x}", self.ambient),
            "capabilities applied"
        );
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn split(&self, shift: u32) -> CapUserData {
        CapUserData {
            effective: (self.effective >> shift) as u32,
            permitted: (self.permitted >> shift) as u32,
            inheritable: (self.inheritable >> shift) as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn names_map_to_kernel_numbers() {
        assert_eq!(number("CAP_CHOWN"), Some(0));
        assert_eq!(number("CAP_NET_BIND_SERVICE"), Some(10));
        assert_eq!(number("CAP_SYS_ADMIN"), Some(21));
        assert_eq!(number("CAP_CHECKPOINT_RESTORE"), Some(40));
        assert_eq!(number("CAP_UNICORN"), None);
    }

    #[test]
    fn unknown_names_are_skipped() {
        let caps = Capabilities {
            bounding: names(&["CAP_KILL", "CAP_UNICORN"]),
            effective: names(&["CAP_KILL"]),
            ..Capabilities::default()
        };
        let sets = CapabilitySets::from_spec(&caps);
        assert_eq!(sets.bounding, 1 << 5);
        assert_eq!(sets.effective, 1 << 5);
        assert_eq!(sets.ambient, 0);
    }

    #[test]
    fn high_capabilities_land_in_second_word() {
        let caps = Capabilities {
            permitted: names(&["CAP_BPF", "CAP_CHOWN"]),
            ..Capabilities::default()
        };
        let sets = CapabilitySets::from_spec(&caps);
        assert_eq!(sets.split(0).permitted, 1);
        assert_eq!(sets.split(32).permitted, 1 << (39 - 32));
    }

    #[test]
    fn kernel_reports_a_plausible_last_cap() {
        assert!(last_cap() >= 36);
    }
}
