use std::io::Write;

use tm_domain::config::{Config, ConfigSeverity, DuplicatePolicy, LogFormat, McpTransportKind};

#[test]
fn empty_document_is_enabled_with_no_servers() {
    let config = Config::parse("").unwrap();
    assert!(config.mcp.enabled);
    assert!(config.mcp.servers.is_empty());
    assert_eq!(config.mcp.request_timeout_secs, 30);
    assert_eq!(config.mcp.duplicate_policy, DuplicatePolicy::FirstWins);
    assert_eq!(config.log.format, LogFormat::Compact);
}

#[test]
fn full_document_parses() {
    let config = Config::parse(
        r#"
[log]
format = "json"

[mcp]
duplicate_policy = "last_wins"
request_timeout_secs = 10

[mcp.health]
interval_secs = 15

[mcp.reconnect]
max_attempts = 5

[[mcp.servers]]
id = "fs"
command = "mcp-fs"
args = ["--root", "/tmp"]

[[mcp.servers]]
id = "search"
transport = "http"
endpoint = "https://search.example.com"
api_key = "secret"
headers = { "X-Team" = "tools" }
auto_reconnect = false
"#,
    )
    .unwrap();

    assert_eq!(config.log.format, LogFormat::Json);
    assert_eq!(config.mcp.duplicate_policy, DuplicatePolicy::LastWins);
    assert_eq!(config.mcp.health.interval_secs, 15);
    assert_eq!(config.mcp.reconnect.max_attempts, 5);
    assert_eq!(config.mcp.servers.len(), 2);

    let search = config.mcp.server("search").unwrap();
    assert_eq!(search.transport, McpTransportKind::Http);
    assert_eq!(search.http_url().as_deref(), Some("https://search.example.com/mcp"));
    assert_eq!(search.headers["X-Team"], "tools");
    assert!(!search.auto_reconnect);

    assert!(config
        .validate()
        .iter()
        .all(|i| i.severity != ConfigSeverity::Error));
}

#[test]
fn invalid_servers_are_reported_and_skipped() {
    let config = Config::parse(
        r#"
[[mcp.servers]]
id = "no-command"

[[mcp.servers]]
id = "ok"
command = "mcp-ok"
"#,
    )
    .unwrap();

    let errors: Vec<_> = config
        .validate()
        .into_iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].field.starts_with("mcp.servers[0]"));

    let usable: Vec<_> = config.mcp.usable_servers().iter().map(|s| s.id.clone()).collect();
    assert_eq!(usable, vec!["ok"]);
}

#[test]
fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert!(config.mcp.servers.is_empty());
}

#[test]
fn load_reads_file_and_names_it_on_error() {
    let mut good = tempfile::NamedTempFile::new().unwrap();
    writeln!(good, "[[mcp.servers]]\nid = \"a\"\ncommand = \"x\"").unwrap();
    let config = Config::load(good.path()).unwrap();
    assert_eq!(config.mcp.servers[0].id, "a");

    let mut bad = tempfile::NamedTempFile::new().unwrap();
    writeln!(bad, "[mcp\nbroken").unwrap();
    let err = Config::load(bad.path()).unwrap_err().to_string();
    assert!(err.contains(&bad.path().display().to_string()), "{err}");
}
