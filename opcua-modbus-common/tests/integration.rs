//! Integration tests for opcua-modbus-common library.

use opcua_modbus_common::{Error, LogFormat, LoggingConfig, init_tracing};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct AppConfig {
    name: String,
    #[serde(default)]
    logging: LoggingConfig,
}

#[test]
fn test_parse_and_init_tracing_once() {
    let config: AppConfig = json5::from_str(
        r#"{
            // JSON5 allows comments and unquoted keys
            name: "gateway",
            logging: { level: "debug", format: "json" },
        }"#,
    )
    .expect("Parse failed");

    assert_eq!(config.name, "gateway");
    assert_eq!(config.logging.format, LogFormat::Json);

    init_tracing(&config.logging).expect("First init should succeed");

    // A global subscriber can only be installed once per process
    let second = init_tracing(&config.logging);
    assert!(matches!(second, Err(Error::Logging(_))));
}

#[test]
fn test_unknown_format_is_rejected() {
    let result: Result<AppConfig, _> =
        json5::from_str(r#"{ name: "gateway", logging: { format: "xml" } }"#);
    assert!(result.is_err());
}
