//! The intermediate child and the container init.
//!
//! The intermediate enters the planned namespaces (asking the monitor to
//! write id mappings when it creates a user namespace) and forks the init,
//! so that the init is pid 1 of a new pid namespace. The init finishes the
//! filesystem and credential setup, reports readiness and then blocks on
//! the exec FIFO until `start` lets it `execve` the user program.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::sys::prctl;
use nix::sys::stat::{Mode, umask};
use nix::unistd::{ForkResult, Gid, Uid, chdir, execve, fork, setgroups, setresgid, setresuid, setsid};

use runcell_common::error::{IsolationError, LaunchError, RuntimeError};
use runcell_common::types::Status;
use runcell_core::capability::CapabilitySets;
use runcell_core::filesystem::{mount, pivot_root};
use runcell_core::namespace::{user, uts};
use runcell_core::{rlimit, sysctl};
use runcell_spec::config::LinuxNamespaceType;
use runcell_spec::container::ProcessSpec;
use runcell_spec::hooks::HookPoint;

use super::LaunchRequest;
use super::sync::{Failure, SyncChannel, SyncMessage};
use crate::{hooks, reaper};

/// Exit code of an init whose `execve` failed after release.
const EXEC_FAILED: i32 = 127;

/// Runs the intermediate child and returns its exit code.
pub(super) fn intermediate(request: &LaunchRequest, mut chan: SyncChannel) -> i32 {
    let _ = reaper::unblock_all();
    match enter_and_fork(request, &mut chan) {
        Ok(()) => 0,
        Err(e) => {
            let _ = chan.send(&SyncMessage::Error(Failure::from_error(&e)));
            1
        }
    }
}

fn enter_and_fork(request: &LaunchRequest, chan: &mut SyncChannel) -> Result<(), RuntimeError> {
    let isolation = &request.isolation;
    if let Some(step) = isolation.user_step() {
        step.enter()?;
        if isolation.creates(LinuxNamespaceType::User) {
            chan.send(&SyncMessage::MappingRequest)?;
            chan.expect(&SyncMessage::MappingDone)?;
        }
        user::become_root()?;
    }
    for step in isolation.remaining_steps() {
        step.enter()?;
    }

    // SAFETY: the intermediate is single-threaded; the child leaves
    // through `_exit` or `execve`.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let code = container_init(request, chan);
            // SAFETY: ends the init without unwinding into the parent's frames.
            unsafe { libc::_exit(code) }
        }
        Ok(ForkResult::Parent { child }) => {
            chan.send(&SyncMessage::InitPid { pid: child.as_raw() })?;
            Ok(())
        }
        Err(e) => Err(LaunchError::Fork {
            message: e.desc().to_string(),
        }
        .into()),
    }
}

/// What the init needs after it has been released.
struct Prepared {
    fifo: File,
    pid: i32,
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
}

fn container_init(request: &LaunchRequest, chan: &mut SyncChannel) -> i32 {
    let mut prepared = match prepare(request, chan).and_then(|prepared| {
        chan.send(&SyncMessage::Ready)?;
        Ok(prepared)
    }) {
        Ok(prepared) => prepared,
        Err(e) => {
            let _ = chan.send(&SyncMessage::Error(Failure::from_error(&e)));
            return 1;
        }
    };

    let mut byte = [0_u8; 1];
    match prepared.fifo.read(&mut byte) {
        Ok(1) => {}
        Ok(_) | Err(_) => return 1,
    }
    drop(prepared.fifo);

    let state = request.hook_state(prepared.pid, Status::Created);
    if let Err(e) = hooks::run_hooks(
        &request.spec.hooks,
        HookPoint::StartContainer,
        &state,
        request.hook_timeout,
    ) {
        tracing::error!(id = %request.id, error = %e, "startContainer hook failed");
        return 1;
    }

    let Err(e) = execve(&prepared.program, &prepared.argv, &prepared.envp);
    tracing::error!(id = %request.id, program = ?prepared.program, error = %e, "execve failed");
    EXEC_FAILED
}

fn prepare(request: &LaunchRequest, chan: &mut SyncChannel) -> Result<Prepared, RuntimeError> {
    let pid = match chan.recv_sync()? {
        SyncMessage::Attached { pid } => pid,
        other => {
            return Err(LaunchError::Sync {
                message: format!("expected cgroup attachment, got {other:?}"),
            }
            .into());
        }
    };
    let spec = &request.spec;

    mount::prepare_rootfs(spec)?;
    // Opened read-write so the open does not block; the path is gone
    // from view after the pivot.
    let fifo = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&request.exec_fifo)
        .map_err(|source| LaunchError::Fifo {
            path: request.exec_fifo.clone(),
            source,
        })?;
    chan.send(&SyncMessage::MountsReady)?;
    chan.expect(&SyncMessage::HooksDone)?;

    pivot_root::pivot_root(&spec.rootfs)?;
    mount::finish_rootfs(spec)?;
    if request.isolation.creates(LinuxNamespaceType::Uts)
        && let Some(hostname) = &spec.hostname
    {
        uts::set_hostname(hostname)?;
    }
    sysctl::apply(&spec.sysctl)?;

    hooks::run_hooks(
        &spec.hooks,
        HookPoint::CreateContainer,
        &request.hook_state(pid, Status::Creating),
        request.hook_timeout,
    )?;

    let process = &spec.process;
    rlimit::apply(&process.rlimits)?;
    if let Some(score) = process.oom_score_adj {
        rlimit::set_oom_score_adj(score)?;
    }
    let _ = setsid().map_err(|e| setup("setsid", e))?;

    let caps = process.capabilities.as_ref().map(CapabilitySets::from_spec);
    if let Some(caps) = &caps {
        caps.drop_bounding()?;
    }
    set_identity(process, request.isolation.is_rootless())?;
    if let Some(caps) = &caps {
        caps.apply()?;
    }
    if process.no_new_privileges {
        prctl::set_no_new_privs().map_err(|e| setup("no_new_privs", e))?;
    }
    if let Some(mask) = process.umask {
        let _ = umask(Mode::from_bits_truncate(mask));
    }
    chdir(&process.cwd).map_err(|e| setup("chdir", e))?;

    let program = resolve_executable(process.program(), process.search_path())?;
    Ok(Prepared {
        fifo,
        pid,
        program: c_string(program.as_os_str().to_string_lossy().into_owned())?,
        argv: process.args.iter().cloned().map(c_string).collect::<Result<_, _>>()?,
        envp: process.env.iter().cloned().map(c_string).collect::<Result<_, _>>()?,
    })
}

fn set_identity(process: &ProcessSpec, rootless: bool) -> Result<(), IsolationError> {
    prctl::set_keepcaps(true).map_err(|e| setup("keepcaps", e))?;
    let groups: Vec<Gid> = process.additional_gids.iter().copied().map(Gid::from_raw).collect();
    // An unprivileged user namespace has setgroups denied.
    if !groups.is_empty() || !rootless {
        setgroups(&groups).map_err(|e| setup("setgroups", e))?;
    }
    let gid = Gid::from_raw(process.gid);
    setresgid(gid, gid, gid).map_err(|e| setup("setgid", e))?;
    let uid = Uid::from_raw(process.uid);
    setresuid(uid, uid, uid).map_err(|e| setup("setuid", e))?;
    prctl::set_keepcaps(false).map_err(|e| setup("keepcaps", e))
}

/// Finds `program` the way `execvp` would: names containing `/` are used
/// as given, anything else is looked up in `search_path`.
///
/// # Errors
///
/// Returns [`LaunchError::ExecNotFound`] if no executable regular file
/// matches.
pub(crate) fn resolve_executable(program: &str, search_path: &str) -> Result<PathBuf, LaunchError> {
    let not_found = || LaunchError::ExecNotFound {
        program: program.to_string(),
    };
    if program.is_empty() {
        return Err(not_found());
    }
    if program.contains('/') {
        let path = PathBuf::from(program);
        return if is_executable(&path) {
            Ok(path)
        } else {
            Err(not_found())
        };
    }
    search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(not_found)
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

fn c_string(value: String) -> Result<CString, IsolationError> {
    CString::new(value).map_err(|e| IsolationError::Setup {
        step: "exec arguments",
        message: e.to_string(),
    })
}

fn setup(step: &'static str, errno: nix::errno::Errno) -> IsolationError {
    IsolationError::Setup {
        step,
        message: errno.desc().to_string(),
    }
}
