use std::{env, fs};

use cachesync_server::AppConfig;
use cachesync_server::config::loader::load_config;
use cachesync_server::config::{BrokerType, CacheType, StrategyType};

// Both scenarios run in one test: the environment is process-wide.
#[test]
fn config_parsing_and_env_overrides_and_validation() {
    serialized_defaults_load_back();

    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("cachesync.toml");

    let toml_content = r#"
[server]
host = "127.0.0.1"
port = 8081
body_limit_bytes = 4096

[logging]
level = "debug"

[cache]
type = "redis"
default_ttl_seconds = 120

[cache.redis]
address = "cache.internal:6380"
password = "secret"
db = 2
pool_size = 8
connect_attempts = 5
connect_backoff_ms = 100

[event_broker]
type = "redis-streams"

[event_broker.redis]
url = "redis://broker.internal:6379"
topics = ["invalidations", "orders"]
group_id = "orders-api"
consumer_name = "node-1"
stream_maxlen = 10000

[event_broker.redis.reader]
batch_size = 16
max_wait_ms = 250
max_payload_bytes = 2048

[event_broker.consumer]
max_consecutive_failures = 7
retry_backoff_ms = 500

[invalidation]
strategy = "ttl-aware"

[invalidation.versioned]
delimiter = ":gen"
default_version = 4

[invalidation.ttl_aware]
max_ttl_seconds = 600
default_ttl_seconds = 60
"#;
    fs::write(&path, toml_content).expect("write config");

    let cfg = load_config(Some(path.to_str().unwrap())).expect("load config");
    assert_eq!(cfg.server.host, "127.0.0.1");
    assert_eq!(cfg.server.port, 8081);
    assert_eq!(cfg.server.body_limit_bytes, 4096);
    assert_eq!(cfg.logging.level, "debug");
    assert_eq!(cfg.cache.backend, CacheType::Redis);
    assert_eq!(cfg.cache.default_ttl_seconds, 120);
    assert_eq!(cfg.cache.redis.url(), "redis://:secret@cache.internal:6380/2");
    assert_eq!(cfg.cache.redis.pool_size, 8);
    assert_eq!(cfg.cache.redis.connect_attempts, 5);
    assert_eq!(cfg.event_broker.broker, BrokerType::RedisStreams);
    assert_eq!(cfg.event_broker.redis.topics, vec!["invalidations", "orders"]);
    assert_eq!(cfg.event_broker.redis.group_id, "orders-api");
    assert_eq!(cfg.event_broker.redis.resolve_consumer_name(), "node-1");
    assert_eq!(cfg.event_broker.redis.stream_maxlen, Some(10000));
    assert_eq!(cfg.event_broker.redis.reader.batch_size, 16);
    assert_eq!(cfg.event_broker.redis.reader.max_wait_ms, 250);
    assert_eq!(cfg.event_broker.redis.reader.max_payload_bytes, 2048);
    assert_eq!(cfg.event_broker.consumer.max_consecutive_failures, 7);
    assert_eq!(cfg.event_broker.consumer.retry_backoff_ms, 500);
    assert_eq!(cfg.invalidation.strategy, StrategyType::TtlAware);
    assert_eq!(cfg.invalidation.versioned.delimiter, ":gen");
    assert_eq!(cfg.invalidation.versioned.default_version, 4);
    assert_eq!(cfg.invalidation.ttl_aware.max_ttl_seconds, 600);

    // Environment overrides win over the file.
    // SAFETY: this is the only test in this binary.
    unsafe {
        env::set_var("CACHESYNC__SERVER__PORT", "9090");
        env::set_var("CACHESYNC__INVALIDATION__VERSIONED__DEFAULT_VERSION", "5");
    }
    let cfg = load_config(Some(path.to_str().unwrap())).expect("load config with env");
    assert_eq!(cfg.server.port, 9090);
    assert_eq!(cfg.invalidation.versioned.default_version, 5);

    // Invalid values are rejected after merging.
    unsafe {
        env::set_var("CACHESYNC__EVENT_BROKER__CONSUMER__MAX_CONSECUTIVE_FAILURES", "0");
    }
    let err = load_config(Some(path.to_str().unwrap())).unwrap_err();
    assert!(err.contains("max_consecutive_failures"), "{err}");

    unsafe {
        env::remove_var("CACHESYNC__SERVER__PORT");
        env::remove_var("CACHESYNC__INVALIDATION__VERSIONED__DEFAULT_VERSION");
        env::remove_var("CACHESYNC__EVENT_BROKER__CONSUMER__MAX_CONSECUTIVE_FAILURES");
    }

    // A missing explicit file is an error.
    let missing = dir.path().join("missing.toml");
    assert!(load_config(Some(missing.to_str().unwrap())).is_err());
}

fn serialized_defaults_load_back() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("defaults.toml");

    let rendered = toml::to_string_pretty(&AppConfig::default()).expect("render defaults");
    fs::write(&path, rendered).expect("write config");

    let cfg = load_config(Some(path.to_str().unwrap())).expect("load rendered defaults");
    assert_eq!(cfg.server.port, 8080);
    assert_eq!(cfg.cache.backend, CacheType::Memory);
    assert_eq!(cfg.event_broker.broker, BrokerType::Memory);
    assert_eq!(cfg.invalidation.versioned.delimiter, ":v");
}
