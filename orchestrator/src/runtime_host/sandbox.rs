//! Isolation applied to process instances: cgroup v2 limits, namespaces,
//! capability and syscall restrictions.
//!
//! Everything in [`Isolation::apply`] runs in the forked child before exec,
//! so it sticks to raw syscalls and pre-built buffers.

use std::{
    fs::{self, File, OpenOptions},
    io,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use data_model::{InstanceId, ResourceLimits};
use nix::{
    sched::CloneFlags,
    sys::wait::{waitpid, WaitStatus},
    unistd::{ForkResult, Pid},
};
use tracing::warn;

use super::Namespace;

const CPU_PERIOD_US: u64 = 100_000;

/// Highest capability number the bounding-set loop tries to drop.
const CAP_LAST_CAP: libc::c_ulong = 40;

const BPF_LD_W_ABS: u16 = 0x20;
const BPF_JMP_JEQ_K: u16 = 0x15;
const BPF_RET_K: u16 = 0x06;

const SECCOMP_MODE_FILTER: libc::c_ulong = 2;
const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

/// Offsets into `struct seccomp_data`.
const SECCOMP_DATA_NR: u32 = 0;
const SECCOMP_DATA_ARCH: u32 = 4;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH: Option<u32> = Some(0xC000_003E);
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH: Option<u32> = Some(0xC000_00B7);
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const AUDIT_ARCH: Option<u32> = None;

/// Syscalls a function handler never needs and a sandbox escape would.
const DENIED_SYSCALLS: &[libc::c_long] = &[
    libc::SYS_mount,
    libc::SYS_umount2,
    libc::SYS_pivot_root,
    libc::SYS_ptrace,
    libc::SYS_reboot,
    libc::SYS_kexec_load,
    libc::SYS_init_module,
    libc::SYS_finit_module,
    libc::SYS_delete_module,
    libc::SYS_swapon,
    libc::SYS_swapoff,
    libc::SYS_setns,
    libc::SYS_unshare,
    libc::SYS_keyctl,
    libc::SYS_add_key,
    libc::SYS_request_key,
    libc::SYS_bpf,
    libc::SYS_perf_event_open,
    libc::SYS_acct,
    libc::SYS_settimeofday,
    libc::SYS_clock_settime,
];

pub(crate) fn clone_flags(namespaces: &[Namespace]) -> CloneFlags {
    namespaces
        .iter()
        .fold(CloneFlags::empty(), |flags, namespace| {
            flags |
                match namespace {
                    Namespace::Pid => CloneFlags::CLONE_NEWPID,
                    Namespace::Mount => CloneFlags::CLONE_NEWNS,
                    Namespace::User => CloneFlags::CLONE_NEWUSER,
                    Namespace::Ipc => CloneFlags::CLONE_NEWIPC,
                    Namespace::Uts => CloneFlags::CLONE_NEWUTS,
                    Namespace::Network => CloneFlags::CLONE_NEWNET,
                }
        })
}

pub(crate) fn cpu_max(cpu_millicores: u64) -> String {
    format!("{} {}", cpu_millicores * CPU_PERIOD_US / 1000, CPU_PERIOD_US)
}

/// Enables the memory and cpu controllers for children of `root`.
pub(crate) fn enable_controllers(root: &Path) -> Result<()> {
    fs::create_dir_all(root).with_context(|| format!("creating cgroup {}", root.display()))?;
    fs::write(root.join("cgroup.subtree_control"), "+memory +cpu")
        .with_context(|| format!("enabling controllers under {}", root.display()))
}

/// cgroup v2 leaf holding one instance.
#[derive(Debug)]
pub(crate) struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    pub fn create(root: &Path, instance_id: &InstanceId, limits: &ResourceLimits) -> Result<Self> {
        let path = root.join(instance_id.get());
        fs::create_dir_all(&path)
            .with_context(|| format!("creating cgroup {}", path.display()))?;
        let cgroup = Self { path };
        if let Err(err) = cgroup.apply_limits(limits) {
            if let Err(remove_err) = Cgroup::remove(&cgroup.path) {
                warn!(
                    cgroup = %cgroup.path.display(),
                    error = %format!("{remove_err:#}"),
                    "failed to remove cgroup after applying limits failed"
                );
            }
            return Err(err);
        }
        Ok(cgroup)
    }

    fn apply_limits(&self, limits: &ResourceLimits) -> Result<()> {
        fs::write(self.path.join("memory.max"), limits.memory_bytes.to_string())
            .context("writing memory.max")?;
        fs::write(self.path.join("cpu.max"), cpu_max(limits.cpu_millicores))
            .context("writing cpu.max")?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opened in the parent so the child only has to write to it.
    pub fn procs_file(&self) -> Result<File> {
        OpenOptions::new()
            .write(true)
            .open(self.path.join("cgroup.procs"))
            .context("opening cgroup.procs")
    }

    /// Removes an emptied cgroup. Missing directories are fine.
    pub fn remove(path: &Path) -> Result<()> {
        match fs::remove_dir(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing cgroup {}", path.display())),
        }
    }
}

/// Pre-built seccomp program that fails denied syscalls with `EPERM` and
/// kills the process on a foreign architecture.
pub(crate) struct SyscallFilter {
    program: Vec<libc::sock_filter>,
}

impl SyscallFilter {
    pub fn deny_privileged() -> Option<Self> {
        let arch = AUDIT_ARCH?;
        let mut program = vec![
            stmt(BPF_LD_W_ABS, SECCOMP_DATA_ARCH),
            jump(BPF_JMP_JEQ_K, arch, 1, 0),
            stmt(BPF_RET_K, SECCOMP_RET_KILL_PROCESS),
            stmt(BPF_LD_W_ABS, SECCOMP_DATA_NR),
        ];
        for nr in DENIED_SYSCALLS {
            program.push(jump(BPF_JMP_JEQ_K, *nr as u32, 0, 1));
            program.push(stmt(
                BPF_RET_K,
                SECCOMP_RET_ERRNO | (libc::EPERM as u32 & 0xffff),
            ));
        }
        program.push(stmt(BPF_RET_K, SECCOMP_RET_ALLOW));
        Some(Self { program })
    }

    fn install(&self) -> io::Result<()> {
        let prog = libc::sock_fprog {
            len: self.program.len() as libc::c_ushort,
            filter: self.program.as_ptr() as *mut libc::sock_filter,
        };
        // SAFETY: `prog` points into `self.program`, which outlives the call.
        let rc = unsafe {
            libc::prctl(
                libc::PR_SET_SECCOMP,
                SECCOMP_MODE_FILTER,
                &prog as *const libc::sock_fprog as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn stmt(code: u16, k: u32) -> libc::sock_filter {
    libc::sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn jump(code: u16, k: u32, jt: u8, jf: u8) -> libc::sock_filter {
    libc::sock_filter { code, jt, jf, k }
}

/// Everything the child applies to itself between fork and exec.
pub(crate) struct Isolation {
    pub namespaces: CloneFlags,
    pub cgroup_procs: Option<File>,
    pub drop_capabilities: bool,
    pub filter: Option<SyscallFilter>,
}

impl Isolation {
    /// Order matters: the cgroup is joined before the user namespace hides
    /// it, and the syscall filter goes last because it denies `unshare` and
    /// `mount`. With a PID namespace this returns in a grandchild of the
    /// spawner.
    pub fn apply(&self) -> io::Result<()> {
        nix::unistd::setsid().map_err(io::Error::from)?;

        if let Some(procs) = &self.cgroup_procs {
            // SAFETY: writing a static buffer to an fd owned by `procs`.
            let written = unsafe {
                libc::write(
                    procs.as_raw_fd(),
                    b"0".as_ptr() as *const libc::c_void,
                    1,
                )
            };
            if written < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        if !self.namespaces.is_empty() {
            nix::sched::unshare(self.namespaces).map_err(io::Error::from)?;
        }
        if self.namespaces.contains(CloneFlags::CLONE_NEWPID) {
            // Only children of the caller enter the new PID namespace.
            enter_pid_namespace()?;
            if self.namespaces.contains(CloneFlags::CLONE_NEWNS) {
                mount_private_proc();
            }
        }

        let zero: libc::c_ulong = 0;
        // SAFETY: plain prctl calls with integer arguments.
        unsafe {
            if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1 as libc::c_ulong, zero, zero, zero) != 0 {
                return Err(io::Error::last_os_error());
            }
            if self.drop_capabilities {
                for cap in 0..=CAP_LAST_CAP {
                    // Unknown capabilities and unprivileged callers fail here,
                    // neither leaves anything to drop.
                    libc::prctl(libc::PR_CAPBSET_DROP, cap, zero, zero, zero);
                }
            }
        }

        if let Some(filter) = &self.filter {
            filter.install()?;
        }
        Ok(())
    }
}

/// Forks so the runtime becomes PID 1 of the namespace created by
/// `unshare`. The intermediate process stays behind as a reaper and exits
/// with the runtime's status, so it keeps the pid the parent tracks and the
/// process group `killpg` targets. Returns only in the runtime.
fn enter_pid_namespace() -> io::Result<()> {
    // SAFETY: called between fork and exec; both sides only make raw
    // syscalls until the runtime execs or the reaper exits.
    match unsafe { nix::unistd::fork() }.map_err(io::Error::from)? {
        ForkResult::Child => {
            // SAFETY: plain prctl with integer arguments.
            unsafe {
                libc::prctl(
                    libc::PR_SET_PDEATHSIG,
                    libc::SIGKILL as libc::c_ulong,
                    0 as libc::c_ulong,
                    0 as libc::c_ulong,
                    0 as libc::c_ulong,
                );
            }
            Ok(())
        }
        ForkResult::Parent { child } => reap(child),
    }
}

/// Runs in the intermediate process and never returns.
fn reap(child: Pid) -> ! {
    // SAFETY: async-signal-safe calls in a single-threaded forked process.
    unsafe {
        // The runtime handles SIGTERM itself and the reaper exits after it.
        libc::signal(libc::SIGTERM, libc::SIG_IGN);
        // Drops the exec status pipe so the spawner sees the runtime exec.
        if libc::syscall(libc::SYS_close_range, 3 as libc::c_uint, libc::c_uint::MAX, 0) != 0 {
            for fd in 3..1024 {
                libc::close(fd);
            }
        }
    }
    let code = loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => break code,
            Ok(WaitStatus::Signaled(_, signal, _)) => break 128 + signal as i32,
            Ok(_) | Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => break 1,
        }
    };
    // SAFETY: exits without running the parent's atexit handlers.
    unsafe { libc::_exit(code) }
}

/// Replaces `/proc` so it describes the new PID namespace. Best effort:
/// some hosts refuse a fresh proc mount inside a user namespace, and the
/// runtime then sees the host's view.
fn mount_private_proc() {
    // SAFETY: static C strings and integer flags.
    unsafe {
        if libc::mount(
            std::ptr::null(),
            c"/".as_ptr(),
            std::ptr::null(),
            libc::MS_REC | libc::MS_PRIVATE,
            std::ptr::null(),
        ) != 0
        {
            return;
        }
        libc::mount(
            c"proc".as_ptr(),
            c"/proc".as_ptr(),
            c"proc".as_ptr(),
            libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
            std::ptr::null(),
        );
    }
}
