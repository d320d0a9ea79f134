use heatwatch::config::LoggingConfig;
use heatwatch::logging::{LogContext, get_logger_with_context, init_logging, parse_log_level};
use tracing::Level;

#[test]
fn parse_levels_accepts_aliases() {
    assert_eq!(parse_log_level("warning").unwrap(), Level::WARN);
    assert_eq!(parse_log_level("CRITICAL").unwrap(), Level::ERROR);
    assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
    assert!(parse_log_level("loud").is_err());
}

#[test]
fn file_logging_init_with_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = LoggingConfig {
        level: "INFO".to_string(),
        console_level: Some("DEBUG".to_string()),
        // Unparseable overrides fall back to the base level
        file_level: Some("bogus".to_string()),
        file: dir.path().join("heatwatch.log").display().to_string(),
        console_output: false,
        ..LoggingConfig::default()
    };
    assert!(init_logging(&cfg).is_ok());
    // Second call is a no-op
    assert!(init_logging(&cfg).is_ok());

    let logger = get_logger_with_context(LogContext::new("collector").with_device("em3"));
    assert_eq!(logger.component(), "collector");
    logger.info("logging initialized for test");
}
