use std::str::FromStr;
use std::time::Instant;
use std::{env, io};

use once_cell::sync::{Lazy, OnceCell};
use thiserror::Error;
use tracing::warn;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Layer, Registry, filter, reload};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);
static LOG_HANDLE: OnceCell<LogHandle> = OnceCell::new();

pub fn setup_logging() {
	Lazy::force(&APPLICATION_START_TIME);
	let use_json = env::var("LOG_FORMAT").unwrap_or("plain".to_string()) == "json";
	tracing_subscriber::registry()
		.with(fmt_layer(BoxMakeWriter::new(io::stdout), use_json))
		.init();
}

fn fmt_layer(writer: BoxMakeWriter, use_json: bool) -> Box<dyn Layer<Registry> + Send + Sync> {
	let format: Box<dyn Layer<Registry> + Send + Sync> = if use_json {
		Box::new(
			tracing_subscriber::fmt::layer()
				.json()
				.flatten_event(true)
				.with_writer(writer),
		)
	} else {
		Box::new(tracing_subscriber::fmt::layer().with_writer(writer))
	};
	let (layer, reload) = reload::Layer::new(format.with_filter(default_filter()));
	LOG_HANDLE
		.set(reload)
		.map_or_else(|_| warn!("setup log handler failed"), |_| {});
	Box::new(layer)
}

fn default_filter() -> filter::Targets {
	let var: String = env::var("RUST_LOG").unwrap_or("info".to_string());
	filter::Targets::from_str(&var).expect("static filter should build")
}

type BoxLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;
type FilteredLayer = filter::Filtered<BoxLayer, filter::Targets, Registry>;
type LogHandle = reload::Handle<FilteredLayer, Registry>;

pub fn get_current_loglevel() -> Result<String, Error> {
	if let Some(handle) = LOG_HANDLE.get() {
		Ok(handle.with_current(|f| f.filter().to_string())?)
	} else {
		Err(Error::Uninitialized)
	}
}

#[derive(Error, Debug)]
pub enum Error {
	#[error("reload failure: {0}")]
	Reload(#[from] reload::Error),
	#[error("logging is not initialized")]
	Uninitialized,
}

/// Mod testing gives access to a test logger, which stores logs in memory for querying.
pub mod testing {
	use std::collections::HashMap;
	use std::io;
	use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

	use once_cell::sync::Lazy;
	use serde_json::Value;
	use tracing_subscriber::fmt;
	use tracing_subscriber::layer::SubscriberExt;
	use tracing_subscriber::util::SubscriberInitExt;

	use super::APPLICATION_START_TIME;

	/// find returns the JSON log lines matching all of the wanted key/value pairs.
	/// Common keys to match on are "target" and "message"; the rest are custom fields.
	/// An empty wanted value asserts the key is absent.
	pub fn find(want: &[(&str, &str)]) -> Vec<Value> {
		let want: HashMap<&str, &str> = HashMap::from_iter(want.iter().cloned());
		let logs = {
			let b = global_buf();
			let buf = b.lock().unwrap();
			std::str::from_utf8(&buf)
				.expect("logs contain invalid UTF8")
				.to_string()
		};
		logs
			.lines()
			.map(|line| serde_json::from_str::<Value>(line).expect("log must be valid json"))
			.filter(|log| {
				want.iter().all(|(k, v)| {
					let Some(have) = log.get(k) else {
						return v.is_empty();
					};
					let have = match have {
						Value::Number(n) => format!("{n}"),
						Value::String(s) => s.clone(),
						Value::Bool(b) => format!("{b}"),
						_ => return false,
					};
					!v.is_empty() && *v == have
				})
			})
			.collect()
	}

	/// MockWriter will store written logs
	#[derive(Debug, Clone)]
	pub struct MockWriter {
		buf: Arc<Mutex<Vec<u8>>>,
	}

	impl MockWriter {
		pub fn new(buf: Arc<Mutex<Vec<u8>>>) -> Self {
			Self { buf }
		}

		fn buf(&self) -> io::Result<MutexGuard<'_, Vec<u8>>> {
			self
				.buf
				.lock()
				.map_err(|_| io::Error::from(io::ErrorKind::Other))
		}
	}

	impl io::Write for MockWriter {
		fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
			let mut target = self.buf()?;
			target.extend_from_slice(buf);
			Ok(buf.len())
		}

		fn flush(&mut self) -> io::Result<()> {
			Ok(())
		}
	}

	impl fmt::MakeWriter<'_> for MockWriter {
		type Writer = Self;

		fn make_writer(&self) -> Self::Writer {
			MockWriter::new(self.buf.clone())
		}
	}

	fn global_buf() -> Arc<Mutex<Vec<u8>>> {
		static GLOBAL_BUF: OnceLock<Arc<Mutex<Vec<u8>>>> = OnceLock::new();
		GLOBAL_BUF
			.get_or_init(|| Arc::new(Mutex::new(vec![])))
			.clone()
	}

	static TRACING: Lazy<()> = Lazy::new(setup_test_logging_internal);

	pub fn setup_test_logging() {
		Lazy::force(&TRACING);
	}

	fn setup_test_logging_internal() {
		Lazy::force(&APPLICATION_START_TIME);
		let mock_writer = MockWriter::new(global_buf());
		let layer = fmt::layer()
			.json()
			.flatten_event(true)
			.with_writer(mock_writer);
		tracing_subscriber::registry().with(layer).init();
	}
}
