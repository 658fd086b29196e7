use std::path::Path;

use tm_domain::config::{Config, ConfigSeverity};

/// Validate the config, printing any issues.
///
/// Returns `false` when at least one error-severity issue was found.
pub fn validate(config: &Config, config_path: &Path) -> bool {
    let issues = config.validate();

    if issues.is_empty() {
        println!("Config OK ({})", config_path.display());
        return true;
    }

    let error_count = issues
        .iter()
        .filter(|e| e.severity == ConfigSeverity::Error)
        .count();
    let warning_count = issues.len() - error_count;

    for issue in &issues {
        println!("{issue}");
    }

    println!(
        "\n{} error(s), {} warning(s) in {}",
        error_count,
        warning_count,
        config_path.display(),
    );

    error_count == 0
}

/// Dump the resolved config (with all defaults filled in) as TOML.
pub fn show(config: &Config) -> anyhow::Result<()> {
    let output = toml::to_string_pretty(config)?;
    print!("{output}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_alone_pass() {
        // An empty server list is only a warning.
        let config = Config::default();
        assert!(validate(&config, Path::new("toolmesh.toml")));
    }

    #[test]
    fn errors_fail() {
        let config = Config::parse("[[mcp.servers]]\nid = \"x\"\ntransport = \"http\"\n").unwrap();
        assert!(!validate(&config, Path::new("toolmesh.toml")));
    }

    #[test]
    fn resolved_config_round_trips_through_toml() {
        let config = Config::parse("[[mcp.servers]]\nid = \"fs\"\ncommand = \"mcp-fs\"\n").unwrap();
        let dumped = toml::to_string_pretty(&config).unwrap();
        let again = Config::parse(&dumped).unwrap();
        assert_eq!(again.mcp.servers, config.mcp.servers);
        assert_eq!(again.mcp.request_timeout_secs, 30);
    }
}
