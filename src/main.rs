mod builtin;
mod config;
mod eval;
mod global;
mod job;
mod logger;
mod parser;
mod types;

use std::io;
use io::BufRead;
use io::Write;

use builtin::Flow;
use parser::ParseError;
use types::Dispatch;

fn process_line(state: &mut global::State, line: &[u8]) -> Flow {
	let dispatch = match parser::parse(line, &state.config.limits) {
		Ok(dispatch) => dispatch,
		Err(ParseError::CdUsage) => {
			println!("{}", ParseError::CdUsage);
			return Flow::Continue;
		},
		Err(e) => {
			eprintln!("lssh: {}", e);
			return Flow::Continue;
		},
	};
	match dispatch {
		Dispatch::Noop => Flow::Continue,
		Dispatch::Exit => builtin::builtin_exit(),
		Dispatch::Cd(path) => builtin::builtin_cd(path),
		Dispatch::Run(command) => {
			for (i, arg) in command.argv.iter().enumerate() {
				log::debug!("{}: '{}'", i, String::from_utf8_lossy(arg));
			}
			match eval::eval(state, &command) {
				Ok(eval::EvalResult::Done(status)) => log::debug!("finished: {:?}", status),
				Ok(eval::EvalResult::Running(pid)) => log::debug!("[{}] running in background", pid),
				Err(e) => eprintln!("lssh: {}", e),
			}
			Flow::Continue
		},
	}
}

fn main() {
	let args: config::Args = argh::from_env();
	let config = config::Config::from(args);
	let _ = logger::init(config.log_level());
	let mut state = global::State::new(config);

	let mut stdout = io::stdout();
	let stdin = io::stdin();
	let mut stdin_locked = stdin.lock();
	let mut line: Vec<u8> = vec![];
	loop {
		state.reaper.collect();
		let _ = stdout.write_all(state.config.prompt.as_bytes());
		let _ = stdout.flush();
		line.clear();
		match stdin_locked.read_until(b'\n', &mut line) {
			Ok(0) => break,
			Ok(_) => {},
			Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
			Err(e) => {
				log::error!("read: {}", e);
				break;
			},
		}
		if process_line(&mut state, &line) == Flow::Exit {
			break;
		}
	}
	state.reaper.collect();
	if state.reaper.pending() > 0 {
		log::debug!("leaving {} background children running", state.reaper.pending());
	}
}
