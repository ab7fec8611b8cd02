use thiserror::Error;

use crate::types::*;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Error)]
pub enum ParseError {
	#[error("line longer than {limit} bytes")]
	LineTooLong { limit: usize },
	#[error("more than {limit} tokens")]
	TooManyTokens { limit: usize },
	#[error("missing command")]
	EmptyCommand,
	#[error("missing file name after '>'")]
	MissingRedirectTarget,
	#[error("missing command after '|'")]
	MissingPipeCommand,
	#[error("Usage: cd path")]
	CdUsage,
}

pub type ParseResult<T> = Result<T, ParseError>;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Limits {
	pub max_line: usize,
	pub max_tokens: usize,
}

const BACKGROUND: &[u8] = b"&";
const REDIRECT: &[u8] = b">";
const PIPE: &[u8] = b"|";

struct Tokenizer<'a> {
	line: &'a [u8],
	i: usize,
}

impl<'a> Tokenizer<'a> {
	fn proceed_while<F>(&mut self, f: F) where F: Fn(u8) -> bool {
		while let Some(c) = self.line.get(self.i) {
			if !f(*c) { break; }
			self.i += 1;
		}
	}

	fn is_whitespace(c: u8) -> bool {
		matches!(c, b' ' | b'\t' | b'\n' | b'\r')
	}

	fn skip_whitespaces(&mut self) {
		self.proceed_while(Tokenizer::is_whitespace);
	}

	fn read_word(&mut self) -> &'a [u8] {
		let orig = self.i;
		self.proceed_while(|c| !Tokenizer::is_whitespace(c));
		&self.line[orig .. self.i]
	}
}

impl<'a> Iterator for Tokenizer<'a> {
	type Item = &'a [u8];

	fn next(&mut self) -> Option<&'a [u8]> {
		self.skip_whitespaces();
		let word = self.read_word();
		if word.is_empty() { None } else { Some(word) }
	}
}

fn strip_line_end(line: &[u8]) -> &[u8] {
	let line = line.strip_suffix(b"\n").unwrap_or(line);
	line.strip_suffix(b"\r").unwrap_or(line)
}

/// Splits a line on runs of space, tab, CR and LF. There is no quoting.
pub fn tokenize<'a>(line: &'a [u8], limits: &Limits) -> ParseResult<Vec<&'a [u8]>> {
	if strip_line_end(line).len() > limits.max_line {
		return Err(ParseError::LineTooLong { limit: limits.max_line });
	}
	let mut tokens = vec![];
	for word in (Tokenizer { line: line, i: 0 }) {
		if tokens.len() == limits.max_tokens {
			return Err(ParseError::TooManyTokens { limit: limits.max_tokens });
		}
		tokens.push(word);
	}
	Ok(tokens)
}

fn find_marker(tokens: &[&[u8]], marker: &[u8]) -> Option<usize> {
	tokens.iter().skip(1).position(|&t| t == marker).map(|i| i + 1)
}

/// Turns a token list into what the shell loop should do with it.
///
/// `argv` ends at the first `>` or `|` past the command name. The token after
/// the first `>` is the redirection target and anything beyond it is dropped.
/// A `|` only starts a second stage when it comes before every `>`. A missing
/// operand is an error only when its modifier is the one that runs.
pub fn classify(mut tokens: Vec<&[u8]>) -> ParseResult<Dispatch> {
	match tokens.first() {
		None => return Ok(Dispatch::Noop),
		Some(&b"exit") => return Ok(Dispatch::Exit),
		Some(&b"cd") => {
			return if tokens.len() == 2 { Ok(Dispatch::Cd(tokens[1])) } else { Err(ParseError::CdUsage) };
		},
		Some(_) => {},
	}

	let background = tokens.last() == Some(&BACKGROUND);
	if background {
		tokens.pop();
		if tokens.is_empty() {
			return Err(ParseError::EmptyCommand);
		}
	}

	let redirect_at = find_marker(&tokens, REDIRECT);
	let pipe_at = find_marker(&tokens, PIPE).filter(|&p| redirect_at.map_or(true, |r| p < r));

	// an operand is only required for the modifier that decides the shape
	let redirect_target = redirect_at.and_then(|r| tokens.get(r + 1).copied());
	if redirect_at.is_some() && redirect_target.is_none() && !background {
		return Err(ParseError::MissingRedirectTarget);
	}
	let pipe_argv = pipe_at
		.map(|p| tokens[p + 1 .. redirect_at.unwrap_or(tokens.len())].to_vec())
		.filter(|right| !right.is_empty());
	if pipe_at.is_some() && pipe_argv.is_none() && !background && redirect_target.is_none() {
		return Err(ParseError::MissingPipeCommand);
	}

	if let Some(end) = pipe_at.or(redirect_at) {
		tokens.truncate(end);
	}

	Ok(Dispatch::Run(Command {
		argv: tokens,
		background: background,
		redirect_target: redirect_target,
		pipe_argv: pipe_argv,
	}))
}

pub fn parse<'a>(line: &'a [u8], limits: &Limits) -> ParseResult<Dispatch<'a>> {
	classify(tokenize(line, limits)?)
}
