//! Runtime configuration, loaded from an optional YAML file and layered
//! under CLI overrides. The registry is populated at runtime, so the
//! config here is plain data loaded straight into a live struct rather
//! than anything resembling a codegen step.

use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Default values, used both as struct field defaults and exposed for
/// anything that wants the compile-time constants directly.
pub mod defaults {
    pub const PORT: u16 = 5064;
    pub const BIND: &str = "0.0.0.0";
    pub const BACKLOG: i32 = 10;
    pub const MAX_CLIENTS: usize = 32;
    pub const CMD_BUFFER_SIZE: usize = 1024;
    pub const RESPONSE_BUFFER_SIZE: usize = 4096;
    pub const MAX_PVS: usize = 128;
    pub const PV_NAME_MAX: usize = 64;
    pub const SELECT_TIMEOUT_MS: u64 = 100;
    pub const TICK_PERIOD_MS: u64 = 10;
    /// A motor consumes three PV slots, so this defaults to a small
    /// fraction of `MAX_PVS`. See DESIGN.md.
    pub const MAX_MOTORS: usize = 16;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub backlog: i32,
    pub max_clients: usize,
    pub cmd_buffer_size: usize,
    pub response_buffer_size: usize,
    pub max_pvs: usize,
    pub pv_name_max: usize,
    pub select_timeout_ms: u64,
    pub tick_period_ms: u64,
    pub max_motors: usize,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: defaults::BIND.to_owned(),
            port: defaults::PORT,
            backlog: defaults::BACKLOG,
            max_clients: defaults::MAX_CLIENTS,
            cmd_buffer_size: defaults::CMD_BUFFER_SIZE,
            response_buffer_size: defaults::RESPONSE_BUFFER_SIZE,
            max_pvs: defaults::MAX_PVS,
            pv_name_max: defaults::PV_NAME_MAX,
            select_timeout_ms: defaults::SELECT_TIMEOUT_MS,
            tick_period_ms: defaults::TICK_PERIOD_MS,
            max_motors: defaults::MAX_MOTORS,
            verbose: false,
        }
    }
}

impl Config {
    /// Loads a config file. Callers apply CLI overrides on top afterward;
    /// CLI flags always win over the file.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            None => Ok(Self::default()),
            Some(p) => {
                let text = fs::read_to_string(p)
                    .map_err(|e| anyhow::anyhow!("reading config {}: {e}", p.display()))?;
                let cfg: Self = serde_yaml::from_str(&text)
                    .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", p.display()))?;
                Ok(cfg)
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 5064);
        assert_eq!(cfg.backlog, 10);
        assert_eq!(cfg.max_clients, 32);
        assert_eq!(cfg.cmd_buffer_size, 1024);
        assert_eq!(cfg.response_buffer_size, 4096);
        assert_eq!(cfg.max_pvs, 128);
        assert_eq!(cfg.pv_name_max, 64);
        assert_eq!(cfg.select_timeout_ms, 100);
        assert_eq!(cfg.tick_period_ms, 10);
    }

    #[test]
    fn loads_partial_yaml_over_defaults() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("devsim-test-config-{}.yaml", std::process::id()));
        fs::write(&path, "port: 6000\nmax_clients: 4\n").unwrap();
        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.max_clients, 4);
        assert_eq!(cfg.backlog, defaults::BACKLOG);
        fs::remove_file(&path).ok();
    }
}
