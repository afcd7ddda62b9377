use std::env;
use std::str::FromStr;

use anyhow::Context as _;
use ephemos_core::prelude::*;
use ephemos_core::telemetry;
use serde::{Deserialize, Serialize};

use crate::identity::{AgentSocket, DEFAULT_AGENT_SOCKET, TrustDomain, ValidationError};

/// Environment overrides share this prefix; keys map by upper-casing and
/// `.` -> `_`, e.g. `service.cache.ttl_minutes` -> `EPHEMOS_SERVICE_CACHE_TTL_MINUTES`.
pub const ENV_PREFIX: &str = "EPHEMOS_";

const DEFAULT_TTL_MINUTES: u64 = 30;
const DEFAULT_PROACTIVE_REFRESH_MINUTES: u64 = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
	service: Option<RawService>,
	agent: Option<RawAgent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawService {
	name: Option<String>,
	domain: Option<String>,
	cache: Option<RawCache>,
	authorized_clients: Option<Vec<String>>,
	trusted_servers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCache {
	ttl_minutes: Option<u64>,
	proactive_refresh_minutes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAgent {
	socket_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
	pub service_name: Strng,
	/// Empty means the trust domain comes from the agent.
	pub trust_domain: Option<TrustDomain>,
	pub socket_path: Strng,
	pub cache_ttl: Duration,
	pub proactive_refresh: Duration,
	pub authorized_clients: Vec<Strng>,
	pub trusted_servers: Vec<Strng>,
	pub debug: bool,
}

/// Parses YAML configuration with environment overrides taking precedence
/// over file values.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
	let raw: RawConfig = if contents.trim().is_empty() {
		RawConfig::default()
	} else {
		serde_yaml::from_str(contents)?
	};
	let service = raw.service.unwrap_or_default();
	let agent = raw.agent.unwrap_or_default();
	let cache = service.cache.unwrap_or_default();

	let name = parse::<String>("service.name")?
		.or(service.name)
		.context("service.name is required")?;
	validate_service_name(&name)?;

	let trust_domain = empty_to_none(parse::<String>("service.domain")?.or(service.domain))
		.map(|d| TrustDomain::from_str(&d))
		.transpose()?;

	let socket_path = parse::<String>("agent.socket_path")?
		.or(agent.socket_path)
		.unwrap_or_else(|| DEFAULT_AGENT_SOCKET.to_string());
	if !socket_path.is_empty() {
		// Reject malformed paths early. An empty path stays empty and is
		// refused at fetch time instead of silently falling back.
		AgentSocket::new(&socket_path)?;
	}

	let ttl_minutes = parse::<u64>("service.cache.ttl_minutes")?
		.or(cache.ttl_minutes)
		.unwrap_or(DEFAULT_TTL_MINUTES);
	if !(1..=60).contains(&ttl_minutes) {
		return Err(
			ValidationError::new(
				"service.cache.ttl_minutes",
				ttl_minutes.to_string(),
				"must be between 1 and 60",
			)
			.into(),
		);
	}

	let refresh_minutes = parse::<u64>("service.cache.proactive_refresh_minutes")?
		.or(cache.proactive_refresh_minutes);
	let proactive_refresh = match refresh_minutes {
		Some(m) => {
			if !(1..ttl_minutes).contains(&m) {
				return Err(
					ValidationError::new(
						"service.cache.proactive_refresh_minutes",
						m.to_string(),
						"must be between 1 and ttl-1",
					)
					.into(),
				);
			}
			Duration::from_secs(m * 60)
		},
		// The default window must still fit under a short TTL. A one-minute
		// TTL leaves no whole minute below it, so fall back to half of it.
		None if ttl_minutes == 1 => Duration::from_secs(30),
		None => Duration::from_secs(DEFAULT_PROACTIVE_REFRESH_MINUTES.min(ttl_minutes - 1) * 60),
	};

	let authorized_clients = peer_list(
		"service.authorized_clients",
		parse_list("service.authorized_clients")?.or(service.authorized_clients),
	)?;
	let trusted_servers = peer_list(
		"service.trusted_servers",
		parse_list("service.trusted_servers")?.or(service.trusted_servers),
	)?;

	let debug = parse::<bool>("debug")?.unwrap_or(false);

	Ok(Config {
		service_name: name.into(),
		trust_domain,
		socket_path: socket_path.into(),
		cache_ttl: Duration::from_secs(ttl_minutes * 60),
		proactive_refresh,
		authorized_clients,
		trusted_servers,
		debug,
	})
}

/// Configuration purely from environment variables.
pub fn from_env() -> anyhow::Result<Config> {
	parse_config("")
}

impl Config {
	/// Rejects configurations that are fine for development but must never
	/// reach production: demo names and domains, non-standard socket
	/// locations, wildcard authorization, and debug-leaning observability.
	pub fn is_production_ready(&self) -> Result<(), ValidationError> {
		const DEMO_DOMAINS: &[&str] = &["example.org", "example.com", "localhost", "demo", "test"];
		const DEMO_NAMES: &[&str] = &["example", "demo"];

		if let Some(td) = &self.trust_domain {
			if DEMO_DOMAINS.iter().any(|d| td.as_str().contains(d)) {
				return Err(ValidationError::new(
					"service.domain",
					td.as_str(),
					"demo/test trust domains are not production ready",
				));
			}
		}
		if DEMO_NAMES.iter().any(|n| self.service_name.contains(n)) {
			return Err(ValidationError::new(
				"service.name",
				self.service_name.to_string(),
				"demo service names are not production ready",
			));
		}
		let socket = AgentSocket::new(&self.socket_path)?;
		if !socket.is_production_path() {
			return Err(ValidationError::new(
				"agent.socket_path",
				socket.path(),
				"must be under /run/, /var/run/, or /tmp/",
			));
		}
		for (field, list) in [
			("service.authorized_clients", &self.authorized_clients),
			("service.trusted_servers", &self.trusted_servers),
		] {
			if let Some(entry) = list.iter().find(|e| e.contains('*')) {
				return Err(ValidationError::new(
					field,
					entry.to_string(),
					"wildcard authorization is not production ready",
				));
			}
		}
		if self.debug {
			return Err(ValidationError::new(
				"debug",
				"true",
				"debug mode is not production ready",
			));
		}
		if let Ok(level) = telemetry::get_current_loglevel() {
			if level.contains("debug") || level.contains("trace") {
				return Err(ValidationError::new(
					"log_level",
					level,
					"debug/trace logging is not production ready",
				));
			}
		}
		Ok(())
	}
}

pub fn env_key(key: &str) -> String {
	format!("{ENV_PREFIX}{}", key.to_uppercase().replace('.', "_"))
}

fn parse<T: FromStr>(key: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	let env_key = env_key(key);
	match env::var(&env_key) {
		Ok(val) => val
			.parse()
			.map(|v| Some(v))
			.map_err(|e: <T as FromStr>::Err| {
				anyhow::anyhow!("invalid env var {}={} ({})", env_key, val, e.to_string())
			}),
		Err(_) => Ok(None),
	}
}

/// Env list values are comma separated.
fn parse_list(key: &str) -> anyhow::Result<Option<Vec<String>>> {
	Ok(parse::<String>(key)?.map(|raw| {
		raw
			.split(',')
			.map(str::trim)
			.filter(|s| !s.is_empty())
			.map(str::to_string)
			.collect()
	}))
}

fn empty_to_none(inp: Option<String>) -> Option<String> {
	match inp {
		Some(s) if s.is_empty() => None,
		other => other,
	}
}

fn validate_service_name(name: &str) -> Result<(), ValidationError> {
	if name.is_empty() {
		return Err(ValidationError::new(
			"service.name",
			name,
			"must not be empty",
		));
	}
	if !name
		.chars()
		.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
	{
		return Err(ValidationError::new(
			"service.name",
			name,
			"must match [A-Za-z0-9_-]+",
		));
	}
	Ok(())
}

/// Peer lists must hold parseable, wildcard-free identity URIs.
fn peer_list(
	field: &'static str,
	entries: Option<Vec<String>>,
) -> Result<Vec<Strng>, ValidationError> {
	entries
		.unwrap_or_default()
		.into_iter()
		.map(|raw| {
			if raw.contains('*') {
				return Err(ValidationError::new(field, raw, "wildcards are not allowed"));
			}
			crate::identity::Identity::from_str(&raw)
				.map_err(|e| ValidationError::new(field, raw.clone(), e.message))?;
			Ok(Strng::from(raw))
		})
		.collect()
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
