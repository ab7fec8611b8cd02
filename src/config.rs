use argh::FromArgs;

use crate::parser::Limits;
use crate::types::RedirectMode;

pub const DEFAULT_PROMPT: &str = "lssh$ ";
pub const DEFAULT_MAX_LINE: usize = 1024;
pub const DEFAULT_MAX_TOKENS: usize = 99;

/// A minimal interactive shell: one command per line, with an optional
/// trailing `&`, one `> file` redirection or one `|` pipe stage.
#[derive(FromArgs, Debug)]
pub struct Args {
	/// prompt printed before each line
	#[argh(option, default = "String::from(DEFAULT_PROMPT)")]
	pub prompt: String,

	/// longest accepted line in bytes, line end excluded
	#[argh(option, default = "DEFAULT_MAX_LINE")]
	pub max_line: usize,

	/// most tokens accepted on one line
	#[argh(option, default = "DEFAULT_MAX_TOKENS")]
	pub max_tokens: usize,

	/// append to redirection targets instead of truncating them
	#[argh(switch, short = 'a')]
	pub append: bool,

	/// log the parsed command and process bookkeeping to stderr
	#[argh(switch, short = 'd')]
	pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
	pub prompt: String,
	pub limits: Limits,
	pub redirect: RedirectMode,
	pub debug: bool,
}

impl Default for Config {
	fn default() -> Config {
		Config {
			prompt: DEFAULT_PROMPT.to_string(),
			limits: Limits { max_line: DEFAULT_MAX_LINE, max_tokens: DEFAULT_MAX_TOKENS },
			redirect: RedirectMode::Truncate,
			debug: false,
		}
	}
}

impl From<Args> for Config {
	fn from(args: Args) -> Config {
		Config {
			prompt: args.prompt,
			limits: Limits { max_line: args.max_line, max_tokens: args.max_tokens },
			redirect: if args.append { RedirectMode::Append } else { RedirectMode::Truncate },
			debug: args.debug,
		}
	}
}

impl Config {
	pub fn log_level(&self) -> log::LevelFilter {
		if self.debug { log::LevelFilter::Debug } else { log::LevelFilter::Warn }
	}
}
