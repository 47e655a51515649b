// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Test logging utilities.

use crate::util::logger::{Logger, Level, Record};

use std::collections::HashMap;
use std::sync::Mutex;

/// A [`Logger`] which records every line it is given, for later assertion in tests.
pub struct TestLogger {
	level: Level,
	id: String,
	/// Count of each `(module, line)` pair logged so far.
	pub lines: Mutex<HashMap<(String, String), usize>>,
}

impl TestLogger {
	/// Creates a `TestLogger` which prints nothing below [`Level::Trace`].
	pub fn new() -> TestLogger {
		Self::with_id("".to_owned())
	}
	/// Creates a `TestLogger` which prefixes printed output with `id`.
	pub fn with_id(id: String) -> TestLogger {
		TestLogger {
			level: Level::Trace,
			id,
			lines: Mutex::new(HashMap::new()),
		}
	}
	/// Sets the level below which records are recorded but not printed.
	pub fn enable(&mut self, level: Level) {
		self.level = level;
	}
	/// Asserts `line` was logged from `module` exactly `count` times.
	pub fn assert_log(&self, module: String, line: String, count: usize) {
		let log_entries = self.lines.lock().unwrap();
		assert_eq!(log_entries.get(&(module, line)), Some(&count));
	}

	/// Search for the number of occurrences of the logged lines which
	/// 1. belong to the specified module and
	/// 2. contain `line` in them.
	/// And asserts if the number of occurrences is the same as the given `count`.
	pub fn assert_log_contains(&self, module: &str, line: &str, count: usize) {
		let log_entries = self.lines.lock().unwrap();
		let l: usize = log_entries.iter().filter(|&(&(ref m, ref l), _c)| {
			m == module && l.contains(line)
		}).map(|(_, c)| { c }).sum();
		assert_eq!(l, count)
	}
}

impl Logger for TestLogger {
	fn log(&self, record: &Record) {
		*self.lines.lock().unwrap().entry((record.module_path.to_string(), format!("{}", record.args))).or_insert(0) += 1;
		if self.level >= record.level {
			println!("{:<5} {} [{} : {}, {}] {}", record.level.to_string(), self.id, record.module_path, record.file, record.line, record.args);
		}
	}
}
