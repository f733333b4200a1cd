//! Config file loading and CLI merging.
//!
//! A run can be described in `fleetmark.toml` or `fleetmark.json`;
//! explicit CLI flags always win over file values.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::args::FleetArgs;
use crate::error::{AppError, AppResult, ConfigError};

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub fleet: FleetSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub udp: UdpSection,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FleetSection {
    pub broker: Option<String>,
    pub run_id: Option<String>,
    pub tool: Option<String>,
    pub agents: Option<usize>,
    #[serde(default)]
    pub agent_names: Vec<String>,
    pub per_agent_topics: Option<bool>,
    pub require_build: Option<String>,
    /// `dest_cidr,gateway[,device]`.
    pub route: Option<String>,
    pub agents_up_timeout_sec: Option<u64>,
    pub phase_timeout_sec: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub op_timeout_sec: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpSection {
    pub url: Option<String>,
    pub connections: Option<u64>,
    pub rate_rps: Option<u64>,
    pub duration_sec: Option<u64>,
    pub threads: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UdpSection {
    pub target: Option<String>,
    pub port: Option<u64>,
    pub packet_size: Option<u64>,
    pub duration_sec: Option<u64>,
    pub min_loss_x100: Option<u64>,
    pub max_loss_x100: Option<u64>,
}

/// Loads a configuration file from the provided path or default locations.
///
/// # Errors
///
/// Returns an error when the config file cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> AppResult<Option<ConfigFile>> {
    if let Some(path) = path {
        let path = PathBuf::from(path);
        return Ok(Some(load_config_file(&path)?));
    }

    let toml_path = PathBuf::from("fleetmark.toml");
    if toml_path.exists() {
        return Ok(Some(load_config_file(&toml_path)?));
    }

    let json_path = PathBuf::from("fleetmark.json");
    if json_path.exists() {
        return Ok(Some(load_config_file(&json_path)?));
    }

    Ok(None)
}

pub(crate) fn load_config_file(path: &Path) -> AppResult<ConfigFile> {
    let content = std::fs::read_to_string(path).map_err(|err| {
        AppError::config(ConfigError::ReadConfig {
            path: path.to_path_buf(),
            source: err,
        })
    })?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&content).map_err(|err| {
            AppError::config(ConfigError::ParseToml {
                path: path.to_path_buf(),
                source: Box::new(err),
            })
        }),
        Some("json") => serde_json::from_str(&content).map_err(|err| {
            AppError::config(ConfigError::ParseJson {
                path: path.to_path_buf(),
                source: err,
            })
        }),
        Some(ext) => Err(AppError::config(ConfigError::UnsupportedExtension {
            ext: ext.to_owned(),
        })),
        None => Err(AppError::config(ConfigError::MissingExtension)),
    }
}

/// Fills unset CLI fields from the `[fleet]` section. Flags given on the
/// command line keep their values.
pub fn apply_config(args: &mut FleetArgs, config: &ConfigFile) {
    let fleet = &config.fleet;
    fill(&mut args.broker, &fleet.broker);
    fill(&mut args.run_id, &fleet.run_id);
    fill(&mut args.tool, &fleet.tool);
    fill(&mut args.agents, &fleet.agents);
    fill(&mut args.require_build, &fleet.require_build);
    fill(&mut args.route, &fleet.route);
    fill(&mut args.agents_up_timeout_sec, &fleet.agents_up_timeout_sec);
    fill(&mut args.phase_timeout_sec, &fleet.phase_timeout_sec);
    fill(&mut args.poll_interval_ms, &fleet.poll_interval_ms);
    fill(&mut args.heartbeat_interval_ms, &fleet.heartbeat_interval_ms);
    fill(&mut args.op_timeout_sec, &fleet.op_timeout_sec);
    fill(&mut args.url, &config.http.url);
    if args.agent_names.is_empty() {
        args.agent_names.clone_from(&fleet.agent_names);
    }
    if !args.per_agent_topics {
        args.per_agent_topics = fleet.per_agent_topics.unwrap_or(false);
    }
}

fn fill<TValue: Clone>(target: &mut Option<TValue>, source: &Option<TValue>) {
    if target.is_none() {
        target.clone_from(source);
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    const SAMPLE: &str = r#"
        [fleet]
        broker = "10.0.0.1:9500"
        run_id = "nightly"
        tool = "udp"
        agents = 4
        poll_interval_ms = 250

        [udp]
        target = "10.0.0.9"
        packet_size = 8192
        max_loss_x100 = 25
    "#;

    #[test]
    fn toml_sections_parse() -> AppResult<()> {
        let config: ConfigFile = toml::from_str(SAMPLE)
            .map_err(|err| AppError::broker(format!("parse failed: {}", err)))?;
        if config.fleet.broker.as_deref() != Some("10.0.0.1:9500")
            || config.udp.packet_size != Some(8192)
        {
            return Err(AppError::broker("Wrong parsed values".to_owned()));
        }
        Ok(())
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<ConfigFile, _> = toml::from_str("[fleet]\nbrokr = \"x\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn cli_flags_win_over_file_values() -> AppResult<()> {
        let config: ConfigFile = toml::from_str(SAMPLE)
            .map_err(|err| AppError::broker(format!("parse failed: {}", err)))?;
        let mut args = FleetArgs::try_parse_from([
            "fleetmark",
            "--broker",
            "127.0.0.1:9000",
            "--agents",
            "2",
        ])?;
        apply_config(&mut args, &config);
        if args.broker.as_deref() != Some("127.0.0.1:9000") || args.agents != Some(2) {
            return Err(AppError::broker("CLI values were overwritten".to_owned()));
        }
        if args.run_id.as_deref() != Some("nightly") || args.poll_interval_ms != Some(250) {
            return Err(AppError::broker("File values not applied".to_owned()));
        }
        Ok(())
    }
}
