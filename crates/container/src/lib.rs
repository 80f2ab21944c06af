// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::env::set_current_dir;
use std::io;
use std::os::fd::{IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

use fs_err as fs;
use nix::libc::SIGCHLD;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chroot, close, fork, getgid, getuid, pipe, pivot_root, read, sethostname, ForkResult, Pid, Uid};
use thiserror::Error;

pub use self::isolation::Isolation;

mod isolation;

/// An isolated filesystem root that a closure is executed inside of.
///
/// With [`Isolation::Namespaces`] the closure runs in fresh user, mount,
/// pid, ipc and uts namespaces with the calling uid/gid mapped to root,
/// so files it creates are recorded as root owned without privilege.
/// With [`Isolation::Chroot`] a plain fork + chroot is used instead,
/// which requires an already privileged caller.
pub struct Container {
    root: PathBuf,
    isolation: Isolation,
    work_dir: Option<PathBuf>,
    binds: Vec<Bind>,
    networking: bool,
    hostname: Option<String>,
}

struct Bind {
    host: PathBuf,
    guest: PathBuf,
    read_only: bool,
}

impl Container {
    pub fn new(root: impl Into<PathBuf>, isolation: Isolation) -> Self {
        Self {
            root: root.into(),
            isolation,
            work_dir: None,
            binds: vec![],
            networking: false,
            hostname: None,
        }
    }

    pub fn work_dir(self, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: Some(work_dir.into()),
            ..self
        }
    }

    /// Bind mount `host` over `guest`, writable
    pub fn bind_rw(mut self, host: impl Into<PathBuf>, guest: impl Into<PathBuf>) -> Self {
        self.binds.push(Bind {
            host: host.into(),
            guest: guest.into(),
            read_only: false,
        });
        self
    }

    /// Bind mount `host` over `guest`, read-only
    pub fn bind_ro(mut self, host: impl Into<PathBuf>, guest: impl Into<PathBuf>) -> Self {
        self.binds.push(Bind {
            host: host.into(),
            guest: guest.into(),
            read_only: true,
        });
        self
    }

    pub fn networking(self, enabled: bool) -> Self {
        Self {
            networking: enabled,
            ..self
        }
    }

    pub fn hostname(self, hostname: impl ToString) -> Self {
        Self {
            hostname: Some(hostname.to_string()),
            ..self
        }
    }

    /// Run `f` inside the container and wait for it to finish
    pub fn run(self, mut f: impl FnMut() -> Result<(), Error>) -> Result<(), Error> {
        match self.isolation {
            Isolation::Namespaces => self.run_namespaced(&mut f),
            Isolation::Chroot => self.run_chrooted(&mut f),
        }
    }

    fn run_namespaced(&self, f: &mut impl FnMut() -> Result<(), Error>) -> Result<(), Error> {
        let mut stack = vec![0u8; 4 * 1024 * 1024];

        let rootless = !Uid::effective().is_root();

        // Pipe to hold the child until uid/gid maps are written
        let sync = pipe().map_err(Error::Nix)?;
        let sync = (sync.0.into_raw_fd(), sync.1.into_raw_fd());

        let mut flags =
            CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWIPC | CloneFlags::CLONE_NEWUTS;

        if rootless {
            flags |= CloneFlags::CLONE_NEWUSER;
        }

        if !self.networking {
            flags |= CloneFlags::CLONE_NEWNET;
        }

        let pid = unsafe {
            clone(
                Box::new(|| match enter(self, sync, f) {
                    Ok(_) => 0,
                    Err(e) => {
                        eprintln!("Error: {e}");
                        1
                    }
                }),
                &mut stack,
                flags,
                Some(SIGCHLD),
            )
            .map_err(Error::Clone)?
        };

        if rootless {
            // Map the current user to root inside the container
            fs::write(format!("/proc/{pid}/setgroups"), "deny")?;
            fs::write(format!("/proc/{pid}/uid_map"), format!("0 {} 1", getuid()))?;
            fs::write(format!("/proc/{pid}/gid_map"), format!("0 {} 1", getgid()))?;
        }

        // Allow child to continue
        close(sync.1).map_err(Error::Nix)?;

        wait_checked(pid)
    }

    fn run_chrooted(&self, f: &mut impl FnMut() -> Result<(), Error>) -> Result<(), Error> {
        if !Uid::effective().is_root() {
            return Err(Error::ChrootRequiresRoot);
        }

        match unsafe { fork().map_err(Error::Nix)? } {
            ForkResult::Parent { child } => wait_checked(child),
            ForkResult::Child => {
                let code = match enter_chroot(self, f) {
                    Ok(_) => 0,
                    Err(e) => {
                        eprintln!("Error: {e}");
                        1
                    }
                };
                std::process::exit(code);
            }
        }
    }
}

fn wait_checked(pid: Pid) -> Result<(), Error> {
    match waitpid(pid, None).map_err(Error::Nix)? {
        WaitStatus::Exited(_, 0) => Ok(()),
        WaitStatus::Exited(_, code) => Err(Error::Failed(code)),
        WaitStatus::Signaled(_, signal, _) => Err(Error::Terminated(signal)),
        _ => Ok(()),
    }
}

fn enter(container: &Container, sync: (RawFd, RawFd), f: &mut impl FnMut() -> Result<(), Error>) -> Result<(), Error> {
    // Close unused write end
    close(sync.1).ok();
    // Wait for EOF once the parent wrote the id maps
    read(sync.0, &mut [0u8; 1]).map_err(Error::Nix)?;
    close(sync.0).ok();

    setup(container)?;

    f()
}

fn enter_chroot(container: &Container, f: &mut impl FnMut() -> Result<(), Error>) -> Result<(), Error> {
    for bind in &container.binds {
        let target = container.root.join(bind.guest.strip_prefix("/").unwrap_or(&bind.guest));
        bind_mount(&bind.host.canonicalize()?, &target, bind.read_only)?;
    }

    // Private dev, proc and tmp inside the chroot
    add_mount(Some("proc"), &container.root.join("proc"), Some("proc"), MsFlags::empty())?;
    add_mount(Some("tmpfs"), &container.root.join("tmp"), Some("tmpfs"), MsFlags::empty())?;
    add_mount(Some("tmpfs"), &container.root.join("dev"), Some("tmpfs"), MsFlags::empty())?;

    chroot(&container.root).map_err(Error::Nix)?;
    set_current_dir("/")?;

    setup_root_user()?;

    if let Some(hostname) = &container.hostname {
        sethostname(hostname).map_err(Error::Nix)?;
    }

    if let Some(dir) = &container.work_dir {
        set_current_dir(dir)?;
    }

    f()
}

fn setup(container: &Container) -> Result<(), Error> {
    if container.networking {
        setup_networking(&container.root)?;
    }

    pivot(&container.root, &container.binds)?;

    setup_root_user()?;

    if let Some(hostname) = &container.hostname {
        sethostname(hostname).map_err(Error::Nix)?;
    }

    if let Some(dir) = &container.work_dir {
        set_current_dir(dir)?;
    }

    Ok(())
}

fn pivot(root: &Path, binds: &[Bind]) -> Result<(), Error> {
    const OLD_PATH: &str = "old_root";

    let old_root = root.join(OLD_PATH);

    add_mount(None::<&Path>, Path::new("/"), None, MsFlags::MS_REC | MsFlags::MS_PRIVATE)?;
    add_mount(Some(root), root, None, MsFlags::MS_BIND)?;

    for bind in binds {
        let source = bind.host.canonicalize()?;
        let target = root.join(bind.guest.strip_prefix("/").unwrap_or(&bind.guest));
        bind_mount(&source, &target, bind.read_only)?;
    }

    ensure_directory(&old_root)?;
    pivot_root(root, &old_root).map_err(Error::Nix)?;

    set_current_dir("/")?;

    add_mount(Some("proc"), Path::new("proc"), Some("proc"), MsFlags::empty())?;
    add_mount(Some("tmpfs"), Path::new("tmp"), Some("tmpfs"), MsFlags::empty())?;
    add_mount(
        Some(format!("/{OLD_PATH}/sys").as_str()),
        Path::new("sys"),
        None,
        MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_SLAVE,
    )?;
    add_mount(
        Some(format!("/{OLD_PATH}/dev").as_str()),
        Path::new("dev"),
        None,
        MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_SLAVE,
    )?;

    umount2(OLD_PATH, MntFlags::MNT_DETACH).map_err(Error::Nix)?;
    fs::remove_dir(OLD_PATH)?;

    Ok(())
}

fn bind_mount(source: &Path, target: &Path, read_only: bool) -> Result<(), Error> {
    add_mount(Some(source), target, None, MsFlags::MS_BIND)?;

    if read_only {
        // Read-only must be applied with a remount
        add_mount(
            Option::<&Path>::None,
            target,
            None,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        )?;
    }

    Ok(())
}

fn setup_root_user() -> Result<(), Error> {
    ensure_directory(Path::new("/etc"))?;
    fs::write("/etc/passwd", "root:x:0:0:root::/bin/bash")?;
    fs::write("/etc/group", "root:x:0:")?;
    Ok(())
}

fn setup_networking(root: &Path) -> Result<(), Error> {
    ensure_directory(&root.join("etc"))?;
    fs::copy("/etc/resolv.conf", root.join("etc/resolv.conf"))?;
    Ok(())
}

fn ensure_directory(path: &Path) -> Result<(), Error> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

fn add_mount<T: AsRef<Path>>(source: Option<T>, target: &Path, fs_type: Option<&str>, flags: MsFlags) -> Result<(), Error> {
    ensure_directory(target)?;
    mount(
        source.as_ref().map(AsRef::as_ref),
        target,
        fs_type,
        flags,
        Option::<&str>::None,
    )
    .map_err(|err| Error::Mount {
        target: target.to_path_buf(),
        err,
    })?;
    Ok(())
}

static FORWARDED_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn forward_handler(_: i32) {
    let pid = FORWARDED_PID.load(Ordering::Relaxed);
    if pid != 0 {
        let _ = kill(Pid::from_raw(pid), Signal::SIGINT);
    }
}

/// Forward SIGINT received by this process to `pid` so interactive
/// interrupts reach the running build script
pub fn forward_sigint(pid: Pid) -> Result<(), Error> {
    FORWARDED_PID.store(pid.as_raw(), Ordering::Relaxed);

    unsafe {
        sigaction(
            Signal::SIGINT,
            &SigAction::new(SigHandler::Handler(forward_handler), SaFlags::empty(), SigSet::empty()),
        )
        .map_err(Error::Nix)?;
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("container exited with status code {0}")]
    Failed(i32),
    #[error("container terminated by signal {}", .0.as_str())]
    Terminated(Signal),
    #[error("chroot isolation requires root privileges")]
    ChrootRequiresRoot,
    #[error("clone container process")]
    Clone(#[source] nix::Error),
    #[error("mount {target:?}")]
    Mount {
        target: PathBuf,
        #[source]
        err: nix::Error,
    },
    #[error(transparent)]
    Nix(nix::Error),
    #[error("io")]
    Io(#[from] io::Error),
}
