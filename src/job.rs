use std::sync::atomic::{AtomicI32, Ordering};

use libc::pid_t;
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum State { Running, Stopped, Terminated }

pub trait WaitStatusExt {
	fn state(self) -> State;
}

impl WaitStatusExt for WaitStatus {
	fn state(self) -> State {
		match self {
			WaitStatus::Exited(..) => State::Terminated,
			WaitStatus::Signaled(..) => State::Terminated,
			WaitStatus::Stopped(..) => State::Stopped,
			#[cfg(any(target_os = "linux", target_os = "android"))]
			WaitStatus::PtraceEvent(..) => State::Stopped,
			#[cfg(any(target_os = "linux", target_os = "android"))]
			WaitStatus::PtraceSyscall(..) => State::Stopped,
			WaitStatus::Continued(..) => State::Running,
			WaitStatus::StillAlive => State::Running,
		}
	}
}

/// Blocks until `pid` terminates and collects it.
///
/// The wait is keyed to `pid`, so the SIGCHLD handler collecting other
/// children never completes it early. Returns `None` when the child had
/// already been collected elsewhere.
pub fn wait_foreground(pid: Pid) -> nix::Result<Option<WaitStatus>> {
	loop {
		match wait::waitpid(pid, None) {
			Ok(status) if status.state() == State::Terminated => return Ok(Some(status)),
			Ok(_) => {},
			Err(Errno::EINTR) => {},
			Err(Errno::ECHILD) => return Ok(None),
			Err(e) => return Err(e),
		}
	}
}

const BACKGROUND_SLOTS: usize = 64;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: AtomicI32 = AtomicI32::new(0);

// Background pids shared with the SIGCHLD handler. Zero marks a free slot.
static SLOTS: [AtomicI32; BACKGROUND_SLOTS] = [EMPTY_SLOT; BACKGROUND_SLOTS];

fn try_collect(pid: pid_t) -> bool {
	match wait::waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
		Ok(status) => status.state() == State::Terminated,
		Err(Errno::ECHILD) => true,
		Err(_) => false,
	}
}

/// Collects every terminated pid in the table without blocking.
/// Async-signal-safe: no allocation, no locks.
fn drain_slots() -> usize {
	let mut collected = 0;
	for slot in SLOTS.iter() {
		let pid = slot.load(Ordering::Acquire);
		if pid != 0 && try_collect(pid)
			&& slot.compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
			collected += 1;
		}
	}
	collected
}

fn claim_slot(pid: Pid) -> bool {
	SLOTS.iter().any(|slot| slot.compare_exchange(0, pid.as_raw(), Ordering::AcqRel, Ordering::Relaxed).is_ok())
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "emscripten"))]
unsafe fn errno_location() -> *mut libc::c_int {
	libc::__errno_location()
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "dragonfly"))]
unsafe fn errno_location() -> *mut libc::c_int {
	libc::__error()
}

#[cfg(any(target_os = "openbsd", target_os = "netbsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
	libc::__errno()
}

extern "C" fn on_sigchld(_: libc::c_int) {
	// waitpid may overwrite errno under the interrupted code
	unsafe {
		let saved = *errno_location();
		drain_slots();
		*errno_location() = saved;
	}
}

fn sigchld_set() -> SigSet {
	let mut set = SigSet::empty();
	set.add(Signal::SIGCHLD);
	set
}

/// Holds SIGCHLD off for the current thread until dropped.
pub struct SigchldBlock {
	set: SigSet,
}

impl SigchldBlock {
	pub fn new() -> nix::Result<SigchldBlock> {
		let set = sigchld_set();
		set.thread_block()?;
		Ok(SigchldBlock { set: set })
	}

	/// For a forked child, before exec: the signal mask survives exec.
	pub fn release_in_child(&self) {
		let _ = self.set.thread_unblock();
	}
}

impl Drop for SigchldBlock {
	fn drop(&mut self) {
		let _ = self.set.thread_unblock();
	}
}

/// Background child bookkeeping.
///
/// Pids live in a fixed table the SIGCHLD handler drains asynchronously.
/// When the table is full they go to `overflow`, which only the shell loop
/// drains, from [`Reaper::collect`].
#[derive(Debug, Default)]
pub struct Reaper {
	armed: bool,
	overflow: Vec<Pid>,
}

impl Reaper {
	pub fn new() -> Reaper {
		Reaper::default()
	}

	/// Installs the SIGCHLD handler once. Restarting and non-one-shot, so a
	/// foreground wait in progress is resumed rather than aborted.
	pub fn arm(&mut self) -> nix::Result<()> {
		if self.armed {
			return Ok(());
		}
		let action = SigAction::new(
			SigHandler::Handler(on_sigchld),
			SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
			SigSet::empty());
		unsafe { signal::sigaction(Signal::SIGCHLD, &action)?; }
		self.armed = true;
		log::debug!("SIGCHLD reaper armed");
		Ok(())
	}

	pub fn is_armed(&self) -> bool {
		self.armed
	}

	/// Call with SIGCHLD blocked so the child cannot be missed between fork
	/// and registration.
	pub fn register(&mut self, pid: Pid) {
		if !claim_slot(pid) {
			log::warn!("background table full, [{}] collected at next prompt", pid);
			self.overflow.push(pid);
		}
	}

	/// Number of background children not yet collected.
	pub fn pending(&self) -> usize {
		SLOTS.iter().filter(|slot| slot.load(Ordering::Acquire) != 0).count() + self.overflow.len()
	}

	/// Non-blocking sweep over every background child, run from the loop.
	pub fn collect(&mut self) -> usize {
		let before = self.overflow.len();
		self.overflow.retain(|pid| !try_collect(pid.as_raw()));
		let collected = drain_slots() + before - self.overflow.len();
		if collected > 0 {
			log::debug!("collected {} background children", collected);
		}
		collected
	}
}
