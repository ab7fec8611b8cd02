use std::ffi::{CStr, CString, NulError};
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::wait::WaitStatus;
use nix::unistd::{self, ForkResult, Pid};
use thiserror::Error;

use crate::global;
use crate::job::{self, SigchldBlock};
use crate::types::*;

#[derive(Debug, Error)]
pub enum ExecError {
	#[error("fork: {0}")]
	Fork(nix::Error),
	#[error("pipe: {0}")]
	Pipe(nix::Error),
	#[error("wait: {0}")]
	Wait(nix::Error),
	#[error("sigaction: {0}")]
	Signal(nix::Error),
	#[error("nul byte in argument: {0}")]
	Nul(#[from] NulError),
}

const SETUP_FAILED: libc::c_int = 126;
const EXEC_FAILED: libc::c_int = 127;

enum Output<'p> {
	Inherit,
	Pipe(RawFd),
	File(&'p CStr, RedirectMode),
}

/// Everything a forked child needs, prepared before the fork so the child
/// only makes async-signal-safe calls.
struct Stage<'p> {
	argv: Vec<CString>,
	// null-terminated pointers into `argv`, for execvp
	argv_ptrs: Vec<*const libc::c_char>,
	stdin: Option<RawFd>,
	stdout: Output<'p>,
	close: &'p [RawFd],
	sigchld_block: Option<&'p SigchldBlock>,
}

impl<'p> Stage<'p> {
	fn new(argv: &[&[u8]]) -> Result<Stage<'p>, NulError> {
		debug_assert!(!argv.is_empty());
		let argv = argv.iter().map(|&s| CString::new(s)).collect::<Result<Vec<_>, _>>()?;
		let argv_ptrs = argv.iter().map(|s| s.as_ptr()).chain(Some(ptr::null())).collect();
		Ok(Stage {
			argv: argv,
			argv_ptrs: argv_ptrs,
			stdin: None,
			stdout: Output::Inherit,
			close: &[],
			sigchld_block: None,
		})
	}
}

fn write_stderr(buf: &[u8]) {
	unsafe { libc::write(libc::STDERR_FILENO, buf.as_ptr() as *const libc::c_void, buf.len()); }
}

fn child_fail(what: &[u8], e: Errno, code: libc::c_int) -> ! {
	write_stderr(b"lssh: ");
	write_stderr(what);
	write_stderr(b": ");
	write_stderr(e.desc().as_bytes());
	write_stderr(b"\n");
	unsafe { libc::_exit(code) }
}

fn open_target(path: &CStr, mode: RedirectMode) -> nix::Result<RawFd> {
	let flags = OFlag::O_WRONLY | OFlag::O_CREAT | match mode {
		RedirectMode::Truncate => OFlag::O_TRUNC,
		RedirectMode::Append => OFlag::O_APPEND,
	};
	let fd = unsafe { libc::open(path.as_ptr(), flags.bits(), 0o644 as libc::c_uint) };
	Errno::result(fd)
}

fn move_fd(fd: RawFd, to: RawFd) -> nix::Result<()> {
	if fd != to {
		unistd::dup2(fd, to)?;
		unistd::close(fd)?;
	}
	Ok(())
}

fn wire<'s>(stage: &'s Stage) -> Result<(), (&'s [u8], Errno)> {
	if let Some(fd) = stage.stdin {
		unistd::dup2(fd, libc::STDIN_FILENO).map_err(|e| (&b"dup2"[..], e))?;
	}
	match stage.stdout {
		Output::Inherit => {},
		Output::Pipe(fd) => {
			unistd::dup2(fd, libc::STDOUT_FILENO).map_err(|e| (&b"dup2"[..], e))?;
		},
		Output::File(path, mode) => {
			let fd = open_target(path, mode).map_err(|e| (path.to_bytes(), e))?;
			move_fd(fd, libc::STDOUT_FILENO).map_err(|e| (&b"dup2"[..], e))?;
		},
	}
	for &fd in stage.close {
		if fd != libc::STDIN_FILENO && fd != libc::STDOUT_FILENO {
			let _ = unistd::close(fd);
		}
	}
	Ok(())
}

fn exec_stage(stage: &Stage) -> ! {
	if let Some(block) = stage.sigchld_block {
		block.release_in_child();
	}
	if let Err((what, e)) = wire(stage) {
		child_fail(what, e, SETUP_FAILED);
	}
	unsafe { libc::execvp(stage.argv_ptrs[0], stage.argv_ptrs.as_ptr()); }
	child_fail(stage.argv[0].to_bytes(), Errno::last(), EXEC_FAILED)
}

fn spawn(stage: &Stage) -> Result<Pid, ExecError> {
	match unsafe { unistd::fork() }.map_err(ExecError::Fork)? {
		ForkResult::Parent { child } => Ok(child),
		ForkResult::Child => exec_stage(stage),
	}
}

fn wait(pid: Pid) -> Result<Option<WaitStatus>, ExecError> {
	let status = job::wait_foreground(pid).map_err(ExecError::Wait)?;
	log::debug!("[{}] collected: {:?}", pid, status);
	Ok(status)
}

pub enum EvalResult {
	/// Status of the last foreground stage, `None` if something else
	/// collected it first.
	Done(Option<WaitStatus>),
	Running(Pid),
}

fn eval_background(state: &mut global::State, argv: &[&[u8]]) -> Result<EvalResult, ExecError> {
	if !state.reaper.is_armed() {
		state.reaper.arm().map_err(ExecError::Signal)?;
	}
	let block = SigchldBlock::new().map_err(ExecError::Signal)?;
	let pid = {
		let mut stage = Stage::new(argv)?;
		stage.sigchld_block = Some(&block);
		spawn(&stage)?
	};
	state.reaper.register(pid);
	drop(block);
	Ok(EvalResult::Running(pid))
}

fn eval_redirected(state: &global::State, argv: &[&[u8]], target: &[u8]) -> Result<EvalResult, ExecError> {
	let target = CString::new(target)?;
	let mut stage = Stage::new(argv)?;
	stage.stdout = Output::File(&target, state.config.redirect);
	let pid = spawn(&stage)?;
	Ok(EvalResult::Done(wait(pid)?))
}

fn eval_piped(left: &[&[u8]], right: &[&[u8]]) -> Result<EvalResult, ExecError> {
	let (pipe_read, pipe_write) = unistd::pipe2(OFlag::O_CLOEXEC).map_err(ExecError::Pipe)?;
	let ends = [pipe_read.as_raw_fd(), pipe_write.as_raw_fd()];
	let mut left = Stage::new(left)?;
	let mut right = Stage::new(right)?;

	right.stdin = Some(ends[0]);
	right.close = &ends;
	left.stdout = Output::Pipe(ends[1]);
	left.close = &ends;

	let right_pid = spawn(&right)?;
	let left_pid = spawn(&left);
	drop(pipe_read);
	drop(pipe_write);

	let left_status = match left_pid {
		Ok(pid) => wait(pid)?,
		Err(e) => {
			// the reader sees EOF now that every write end is closed
			wait(right_pid)?;
			return Err(e);
		},
	};
	let right_status = wait(right_pid)?;
	log::debug!("pipeline done: {:?} | {:?}", left_status, right_status);
	Ok(EvalResult::Done(right_status))
}

/// Runs one classified command. Errors come from the shell's side of the
/// fork; a child that cannot start reports for itself and exits 126 or 127.
pub fn eval(state: &mut global::State, command: &Command) -> Result<EvalResult, ExecError> {
	for modifier in command.ignored_modifiers() {
		log::warn!("{} ignored", modifier);
	}
	match command.job() {
		Job::Plain(argv) => {
			let pid = spawn(&Stage::new(argv)?)?;
			Ok(EvalResult::Done(wait(pid)?))
		},
		Job::Background(argv) => eval_background(state, argv),
		Job::Redirected { argv, target } => eval_redirected(state, argv, target),
		Job::Piped { left, right } => eval_piped(left, right),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;
	use crate::parser::{self, Limits};
	use mktemp::Temp;
	use serial_test::serial;
	use std::fs;
	use std::path::Path;
	use std::thread::sleep;
	use std::time::{Duration, Instant};

	const LIMITS: Limits = Limits { max_line: 1024, max_tokens: 99 };

	fn run_line(state: &mut global::State, line: &str) -> Result<EvalResult, ExecError> {
		match parser::parse(line.as_bytes(), &LIMITS) {
			Ok(Dispatch::Run(command)) => eval(state, &command),
			other => panic!("{:?} is not a command line: {:?}", line, other),
		}
	}

	fn exit_code(r: Result<EvalResult, ExecError>) -> i32 {
		match r {
			Ok(EvalResult::Done(Some(WaitStatus::Exited(_, code)))) => code,
			Ok(EvalResult::Done(status)) => panic!("unexpected status {:?}", status),
			Ok(EvalResult::Running(pid)) => panic!("[{}] unexpectedly in background", pid),
			Err(e) => panic!("eval failed: {}", e),
		}
	}

	fn path_str(path: &Path) -> &str {
		path.to_str().unwrap()
	}

	#[test]
	#[serial]
	fn plain_command_is_waited_for() {
		let mut state = global::State::new(Config::default());
		assert_eq!(exit_code(run_line(&mut state, "true")), 0);
		assert_eq!(exit_code(run_line(&mut state, "false")), 1);
	}

	#[test]
	#[serial]
	fn missing_program_exits_127() {
		let mut state = global::State::new(Config::default());
		assert_eq!(exit_code(run_line(&mut state, "lssh-no-such-program-here")), EXEC_FAILED);
	}

	#[test]
	#[serial]
	fn redirection_writes_file() {
		let dir = Temp::new_dir().unwrap();
		let out = dir.as_path().join("out.txt");
		let mut state = global::State::new(Config::default());
		let line = format!("echo hello > {} ignored", path_str(&out));
		assert_eq!(exit_code(run_line(&mut state, &line)), 0);
		assert_eq!(fs::read(&out).unwrap(), b"hello\n");
	}

	#[test]
	#[serial]
	fn redirection_truncates_by_default() {
		let dir = Temp::new_dir().unwrap();
		let out = dir.as_path().join("out.txt");
		fs::write(&out, b"a much longer previous content\n").unwrap();
		let mut state = global::State::new(Config::default());
		assert_eq!(exit_code(run_line(&mut state, &format!("echo new > {}", path_str(&out)))), 0);
		assert_eq!(fs::read(&out).unwrap(), b"new\n");
	}

	#[test]
	#[serial]
	fn redirection_appends_when_configured() {
		let dir = Temp::new_dir().unwrap();
		let out = dir.as_path().join("out.txt");
		let mut state = global::State::new(Config { redirect: RedirectMode::Append, ..Config::default() });
		assert_eq!(exit_code(run_line(&mut state, &format!("echo one > {}", path_str(&out)))), 0);
		assert_eq!(exit_code(run_line(&mut state, &format!("echo two > {}", path_str(&out)))), 0);
		assert_eq!(fs::read(&out).unwrap(), b"one\ntwo\n");
	}

	#[test]
	#[serial]
	fn unopenable_target_stops_child_before_exec() {
		let dir = Temp::new_dir().unwrap();
		let out = dir.as_path().join("missing").join("out.txt");
		let mut state = global::State::new(Config::default());
		assert_eq!(exit_code(run_line(&mut state, &format!("echo hi > {}", path_str(&out)))), SETUP_FAILED);
		assert!(!out.exists());
	}

	#[test]
	#[serial]
	fn pipe_connects_both_stages() {
		let dir = Temp::new_dir().unwrap();
		let out = dir.as_path().join("count.txt");
		let mut state = global::State::new(Config::default());
		let left: Vec<&[u8]> = vec![&b"printf"[..], &b"a\\nb\\nc\\n"[..]];
		let sink = format!("wc -l > {}", path_str(&out));
		let right: Vec<&[u8]> = vec![&b"sh"[..], &b"-c"[..], sink.as_bytes()];
		let command = Command { argv: left, background: false, redirect_target: None, pipe_argv: Some(right) };
		assert_eq!(exit_code(eval(&mut state, &command)), 0);
		assert_eq!(String::from_utf8(fs::read(&out).unwrap()).unwrap().trim(), "3");
	}

	#[test]
	#[serial]
	fn background_returns_immediately_and_is_reaped() {
		let mut state = global::State::new(Config::default());
		let started = Instant::now();
		let pid = match run_line(&mut state, "sleep 1 &") {
			Ok(EvalResult::Running(pid)) => pid,
			_ => panic!("sleep did not go to the background"),
		};
		assert!(started.elapsed() < Duration::from_millis(900));
		assert!(state.reaper.is_armed());

		assert_eq!(exit_code(run_line(&mut state, "true")), 0);

		let deadline = Instant::now() + Duration::from_secs(10);
		while state.reaper.pending() > 0 && Instant::now() < deadline {
			sleep(Duration::from_millis(20));
		}
		assert_eq!(state.reaper.pending(), 0);
		assert_eq!(nix::sys::wait::waitpid(pid, Some(nix::sys::wait::WaitPidFlag::WNOHANG)), Err(Errno::ECHILD));
	}

	#[cfg(any(target_os = "linux", target_os = "android"))]
	fn open_fds() -> usize {
		fs::read_dir("/proc/self/fd").unwrap().count()
	}

	#[cfg(any(target_os = "linux", target_os = "android"))]
	#[test]
	#[serial]
	fn repeated_dispatch_leaks_no_descriptors() {
		let dir = Temp::new_dir().unwrap();
		let out = dir.as_path().join("out.txt");
		let redirected = format!("echo hi > {}", path_str(&out));
		let mut state = global::State::new(Config::default());
		let before = open_fds();
		for _ in 0 .. 20 {
			assert_eq!(exit_code(run_line(&mut state, "echo hi | true")), 0);
			assert_eq!(exit_code(run_line(&mut state, &redirected)), 0);
		}
		assert_eq!(open_fds(), before);
	}

	#[test]
	#[serial]
	fn failing_pipe_stage_only_fails_itself() {
		let mut state = global::State::new(Config::default());
		assert_eq!(exit_code(run_line(&mut state, "true | lssh-no-such-program-here")), EXEC_FAILED);
		assert_eq!(exit_code(run_line(&mut state, "lssh-no-such-program-here | true")), 0);
		assert_eq!(exit_code(run_line(&mut state, "echo next")), 0);
	}

	#[test]
	fn argv_pointers_are_null_terminated() {
		let stage = Stage::new(&[&b"echo"[..], &b"hi"[..]]).unwrap();
		assert_eq!(stage.argv_ptrs.len(), 3);
		assert_eq!(stage.argv_ptrs[0], stage.argv[0].as_ptr());
		assert_eq!(stage.argv_ptrs[1], stage.argv[1].as_ptr());
		assert!(stage.argv_ptrs[2].is_null());
	}

	#[test]
	fn nul_in_argument_is_rejected_before_fork() {
		let mut state = global::State::new(Config::default());
		let argv: Vec<&[u8]> = vec![&b"echo"[..], &b"a\0b"[..]];
		let command = Command { argv: argv, background: false, redirect_target: None, pipe_argv: None };
		assert!(matches!(eval(&mut state, &command), Err(ExecError::Nul(_))));
	}
}
