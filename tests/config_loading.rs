use std::io::Write;

use phaseflow_core::config::AppConfig;
use phaseflow_core::error::PhaseflowError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_node_visits = 50
default_max_retries = 5
command_timeout_secs = 30
working_dir = "/tmp/phaseflow-test"

[llm]
command = "claude -p"
tools = ["read_file", "grep"]
timeout_secs = 90

[memory]
path = "/tmp/phaseflow-test/memory.db"

[log]
enabled = true
log_dir = "/tmp/phaseflow-test/logs"
level = 3
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_node_visits, 50);
    assert_eq!(config.engine.default_max_retries, 5);
    assert_eq!(config.engine.command_timeout_secs, 30);
    assert_eq!(
        config.engine.working_dir.as_deref(),
        Some("/tmp/phaseflow-test")
    );

    assert_eq!(config.llm.command.as_deref(), Some("claude -p"));
    assert_eq!(config.llm.tools, vec!["read_file", "grep"]);
    assert_eq!(config.llm.timeout_secs, 90);

    assert_eq!(
        config.memory_path(),
        std::path::PathBuf::from("/tmp/phaseflow-test/memory.db")
    );
    let log = config.log.as_ref().expect("log present");
    assert_eq!(log.level, 3);
    assert_eq!(
        config.log_dir(),
        Some(std::path::PathBuf::from("/tmp/phaseflow-test/logs"))
    );
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("PHASEFLOW_TEST_LLM_COMMAND", "my-llm --json");

    let toml_content = r#"
[llm]
command = "${PHASEFLOW_TEST_LLM_COMMAND}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.llm.command.as_deref(), Some("my-llm --json"));

    std::env::remove_var("PHASEFLOW_TEST_LLM_COMMAND");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[llm]
command = "cat"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_node_visits, 100);
    assert_eq!(config.engine.default_max_retries, 3);
    assert_eq!(config.engine.command_timeout_secs, 120);
    assert!(config.engine.working_dir.is_none());
    assert!(config.llm.tools.is_empty());
    assert_eq!(config.llm.timeout_secs, 300);
    assert!(config.log.is_none());
}

#[test]
fn test_disabled_log_has_no_dir() {
    let toml_content = r#"
[log]
enabled = false
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert!(config.log.is_some());
    assert!(config.log_dir().is_none());
}

#[test]
fn test_invalid_values_rejected() {
    let toml_content = r#"
[engine]
default_max_retries = 0
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, PhaseflowError::Config(_)));
}

#[test]
fn test_missing_file() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/phaseflow.toml")).unwrap_err();
    assert!(matches!(err, PhaseflowError::ConfigNotFound(_)));
}
