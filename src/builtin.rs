use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use nix::unistd;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Flow { Continue, Exit }

pub fn cd(path: &[u8]) -> nix::Result<()> {
	unistd::chdir(OsStr::from_bytes(path))
}

pub fn builtin_cd(path: &[u8]) -> Flow {
	if let Err(e) = cd(path) {
		eprintln!("chdir: {}", e.desc());
	}
	Flow::Continue
}

pub fn builtin_exit() -> Flow {
	Flow::Exit
}
