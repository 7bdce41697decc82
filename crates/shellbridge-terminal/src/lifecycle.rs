//! Sandbox root preparation, shell binary sealing, and the fork/exec/mount
//! choreography that brings a sandbox process tree up.
//!
//! `portable-pty` (the teacher's original PTY abstraction) is intentionally
//! not used here: its `CommandBuilder` has no hook for clearing `O_CLOEXEC`
//! on specific inherited descriptors or for the pre-exec env var wiring the
//! launcher needs, so the fork/exec is done directly against `nix`.

use std::ffi::CString;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::pty::{openpty, OpenptyResult};
use nix::unistd::{fork, ForkResult};
use tokio::sync::Mutex as AsyncMutex;

use shellbridge_core::config::SandboxConfig;

use crate::error::{Result, SessionError};
use crate::pidfd;

/// Serializes the `fork + pidfd_open` window so a PID can never be reaped
/// and recycled between the two calls. Held across both the sandbox launcher
/// fork and the network helper spawn.
pub static REAPER: AsyncMutex<()> = AsyncMutex::const_new(());

pub struct SandboxRoot {
    pub run_dir: PathBuf,
    pub root_dir: PathBuf,
}

/// Ensure `<runroot>/<idname>/root` exists and is mounted, tearing down and
/// remounting a fresh overlay when `reinit` is set or no prior run exists.
pub fn ensure_root(cfg: &SandboxConfig, idname: &str, reinit: bool) -> Result<SandboxRoot> {
    let run_dir = Path::new(&cfg.runroot).join(idname);
    let root_dir = run_dir.join("root");
    let run_exists = run_dir.exists();

    if reinit || !run_exists {
        teardown_root(&root_dir, &run_dir);

        (|| -> Result<()> {
            std::fs::create_dir_all(&run_dir)?;

            mount(
                Some("tmpfs"),
                &run_dir,
                Some("tmpfs"),
                MsFlags::empty(),
                None::<&str>,
            )
            .map_err(|e| SessionError::Overlay(format!("mount tmpfs on run dir: {e}")))?;

            let upper = run_dir.join("upper");
            let work = run_dir.join("work");
            std::fs::create_dir_all(&upper)?;
            std::fs::create_dir_all(&work)?;
            std::fs::create_dir_all(&root_dir)?;

            let opts = format!(
                "lowerdir={},upperdir={},workdir={}",
                cfg.base_image,
                upper.display(),
                work.display()
            );
            mount(
                Some("overlay"),
                &root_dir,
                Some("overlay"),
                MsFlags::empty(),
                Some(opts.as_str()),
            )
            .map_err(|e| SessionError::Overlay(format!("mount overlay: {e}")))?;

            Ok(())
        })()
        .map_err(|e| {
            let _ = umount2(&run_dir, MntFlags::MNT_DETACH);
            e
        })?;
    }

    if !root_dir.exists() {
        return Err(SessionError::Overlay(format!(
            "root dir {} missing after ensure_root",
            root_dir.display()
        )));
    }

    Ok(SandboxRoot { run_dir, root_dir })
}

/// Copy the on-host shell binary into an anonymous, exec-only memfd. The fd
/// is handed to the launcher child and exec'd via `/proc/self/fd/N`; nothing
/// on the writable overlay ever holds a copy of the binary.
pub fn seal_shell_binary(path: &str) -> Result<OwnedFd> {
    let memfd = memfd::MemfdOptions::default()
        .create("shellbridge-shell")
        .map_err(|e| SessionError::PtySpawn(format!("memfd_create: {e}")))?;

    let mut src = std::fs::File::open(path)?;
    let mut dst = memfd.into_file();
    std::io::copy(&mut src, &mut dst)?;

    Ok(unsafe { OwnedFd::from_raw_fd(dst.into_raw_fd()) })
}

/// One forked-and-exec'd sandbox launcher: owns the PTY master, the control
/// socket's bridge-side half, and the launcher's pidfd.
pub struct Launcher {
    pub ptm: OwnedFd,
    pub control: UnixDatagram,
    pub pidfd: OwnedFd,
}

/// Fork, clear cloexec on the fds the launcher needs, set its env, and
/// `execve` the launcher script in the child. Must run under `REAPER`.
pub async fn spawn_launcher(
    cfg: &SandboxConfig,
    root: &SandboxRoot,
    exe_fd: &OwnedFd,
    upload_uuid: &str,
) -> Result<Launcher> {
    let OpenptyResult { master, slave } =
        openpty(None, None).map_err(|e| SessionError::PtySpawn(format!("openpty: {e}")))?;

    // SOCK_SEQPACKET is what the sandbox-side protocol expects; std's
    // UnixDatagram::pair only offers SOCK_DGRAM, so the pair is built
    // directly against the kernel with the right socket type.
    let (bridge_fd, jail_fd) = raw_seqpacket_pair()?;
    let bridge_sock = unsafe { UnixDatagram::from_raw_fd(bridge_fd.into_raw_fd()) };

    let _guard = REAPER.lock().await;

    // SAFETY: the child only touches async-signal-safe APIs (dup2-free fd
    // flag clears, env vars, execve) before exec; no allocator use beyond
    // what CString already did in the parent.
    match unsafe { fork() }.map_err(|e| SessionError::PtySpawn(format!("fork: {e}")))? {
        ForkResult::Child => {
            drop(master);
            unset_cloexec(jail_fd.as_raw_fd());
            unset_cloexec(exe_fd.as_raw_fd());

            let _ = nix::unistd::setsid();
            let _ = unsafe { libc::login_tty(slave.as_raw_fd()) };

            std::env::set_var("SOCK_FD", jail_fd.as_raw_fd().to_string());
            std::env::set_var("EXE_FD", exe_fd.as_raw_fd().to_string());
            std::env::set_var("ROOTDIR", &root.root_dir);
            std::env::set_var("DISCORD_UPLOAD_UUID", upload_uuid);

            let launcher = CString::new(cfg.launcher_script.clone()).expect("no NUL in path");
            let _ = nix::unistd::execv(&launcher, &[launcher.clone()]);
            std::process::exit(1);
        }
        ForkResult::Parent { child } => {
            drop(slave);
            drop(jail_fd);

            set_nonblocking(master.as_raw_fd())?;
            fcntl(master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
                .map_err(|e| SessionError::PtySpawn(format!("fcntl cloexec: {e}")))?;

            let pidfd = pidfd::pidfd_open(child.as_raw() as libc::pid_t)?;

            Ok(Launcher {
                ptm: master,
                control: bridge_sock,
                pidfd,
            })
        }
    }
}

fn raw_seqpacket_pair() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK,
            0,
            fds.as_mut_ptr(),
        )
    };
    if ret < 0 {
        return Err(SessionError::ControlSocket(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(unsafe {
        (
            OwnedFd::from_raw_fd(fds[0]),
            OwnedFd::from_raw_fd(fds[1]),
        )
    })
}

fn unset_cloexec(fd: RawFd) {
    let _ = fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()));
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)
        .map_err(|e| SessionError::PtySpawn(format!("fcntl getfl: {e}")))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))
        .map_err(|e| SessionError::PtySpawn(format!("fcntl setfl: {e}")))?;
    Ok(())
}

/// Spawn the user-space network helper attached to `netns_fd`, under the
/// reaper lock (`pidfd_open` right after spawn, before anything can reap the
/// child). Mirrors the original's `os.spawnlp` + `pidfd_open` pairing: a
/// helper process whose PID we only have for the instant between spawn and
/// pidfd_open.
pub async fn spawn_network_helper(cfg: &SandboxConfig, netns_fd: BorrowedFd<'_>) -> Result<OwnedFd> {
    let _guard = REAPER.lock().await;

    let path = CString::new(cfg.slirp_binary.clone()).expect("no NUL in path");
    let netns_path = format!("/proc/{}/fd/{}", std::process::id(), netns_fd.as_raw_fd());
    let args: Vec<CString> = [
        cfg.slirp_binary.as_str(),
        "--configure",
        "--mtu=65520",
        "--disable-host-loopback",
        "--enable-sandbox",
        "--enable-seccomp",
        "--netns-type=path",
        netns_path.as_str(),
        "tap0",
    ]
    .iter()
    .map(|s| CString::new(*s).expect("no NUL in arg"))
    .collect();

    match unsafe { fork() }.map_err(|e| SessionError::PtySpawn(format!("fork: {e}")))? {
        ForkResult::Child => {
            let _ = nix::unistd::execvp(&path, &args);
            std::process::exit(1);
        }
        ForkResult::Parent { child } => pidfd::pidfd_open(child.as_raw() as libc::pid_t),
    }
}

/// SIGKILL (bwrap/bash) or SIGTERM (slirp4netns) a pidfd-tracked process and
/// close the pidfd. Best-effort: ESRCH (already dead) is not an error.
pub fn kill_pidfd(fd: &OwnedFd, signal: libc::c_int) {
    let _ = pidfd::pidfd_send_signal(fd.as_raw_fd(), signal);
}

/// Unmount the overlay and its backing tmpfs. Only called from `ensure_root`'s
/// `reinit` path — an ordinary session teardown leaves the mount in place so
/// user state survives a reconnect.
fn teardown_root(root_dir: &Path, run_dir: &Path) {
    let _ = umount2(root_dir, MntFlags::MNT_DETACH);
    let _ = umount2(run_dir, MntFlags::MNT_DETACH);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_shell_binary_copies_into_memfd() {
        let tmp = std::env::temp_dir().join("shellbridge-seal-test");
        std::fs::write(&tmp, b"#!/bin/sh\necho hi\n").unwrap();
        let fd = seal_shell_binary(tmp.to_str().unwrap()).unwrap();
        assert!(fd.as_raw_fd() >= 0);
        std::fs::remove_file(&tmp).ok();
    }
}
