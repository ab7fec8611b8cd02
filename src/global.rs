use crate::config::Config;
use crate::job;

pub struct State {
	pub config: Config,
	pub reaper: job::Reaper,
}

impl State {
	pub fn new(config: Config) -> State {
		State { config: config, reaper: job::Reaper::new() }
	}
}
