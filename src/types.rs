#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RedirectMode { Truncate, Append }

/// One classified input line, borrowing its tokens from the line buffer.
///
/// `argv` never holds a modifier marker or anything after one.
#[derive(Debug, PartialEq, Eq)]
pub struct Command<'a> {
	pub argv: Vec<&'a [u8]>,
	pub background: bool,
	pub redirect_target: Option<&'a [u8]>,
	pub pipe_argv: Option<Vec<&'a [u8]>>,
}

/// The execution shape the launcher runs. Exactly one per command.
#[derive(Debug, PartialEq, Eq)]
pub enum Job<'a, 'c> {
	Plain(&'c [&'a [u8]]),
	Background(&'c [&'a [u8]]),
	Redirected { argv: &'c [&'a [u8]], target: &'a [u8] },
	Piped { left: &'c [&'a [u8]], right: &'c [&'a [u8]] },
}

impl<'a> Command<'a> {
	/// Background wins over redirection, which wins over the pipe.
	pub fn job<'c>(&'c self) -> Job<'a, 'c> {
		if self.background {
			Job::Background(&self.argv)
		} else if let Some(target) = self.redirect_target {
			Job::Redirected { argv: &self.argv, target: target }
		} else if let Some(ref right) = self.pipe_argv {
			Job::Piped { left: &self.argv, right: right }
		} else {
			Job::Plain(&self.argv)
		}
	}

	/// Modifiers that were recognized but lose to a higher-precedence shape.
	pub fn ignored_modifiers(&self) -> Vec<&'static str> {
		let mut ignored = vec![];
		if self.background && self.redirect_target.is_some() {
			ignored.push("redirection");
		}
		if (self.background || self.redirect_target.is_some()) && self.pipe_argv.is_some() {
			ignored.push("pipe");
		}
		ignored
	}
}

/// What the shell loop does with a line.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch<'a> {
	Noop,
	Exit,
	Cd(&'a [u8]),
	Run(Command<'a>),
}
