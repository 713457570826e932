use listing_sync::config::{ConfigLoader, RestartPolicy};
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    unsafe {
        for key in [
            "LISTING_SYNC_PROFILE",
            "LISTING_SYNC_API_BIND_ADDR",
            "LISTING_SYNC_LOG_LEVEL",
            "LISTING_SYNC_DESTINATION_API_BASE",
            "LISTING_SYNC_DESTINATION_API_TOKEN",
            "LISTING_SYNC_SYNC_RESTART_POLICY",
            "LISTING_SYNC_SYNC_MAX_ITEMS_PER_JOB",
            "LISTING_SYNC_RATE_LIMIT_BASE_SECONDS",
            "LISTING_SYNC_RATE_LIMIT_MESSAGE_PATTERNS",
        ] {
            env::remove_var(key);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.sync.restart_policy, RestartPolicy::Fail);
    assert_eq!(cfg.rate_limit_policy.min_seconds, 1);
    assert!(cfg.destination_api_base.is_none());
    cfg.bind_addr().expect("default bind addr parses");
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "LISTING_SYNC_API_BIND_ADDR=127.0.0.1:3000\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test",
        "LISTING_SYNC_API_BIND_ADDR=192.168.0.10:5000\nLISTING_SYNC_RATE_LIMIT_BASE_SECONDS=7\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "LISTING_SYNC_API_BIND_ADDR=10.0.0.5:6000\n",
    );

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "LISTING_SYNC_PROFILE=test\nLISTING_SYNC_API_BIND_ADDR=127.0.0.1:4000\n",
    );

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("layered config loads");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.rate_limit_policy.base_seconds, 7);
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "LISTING_SYNC_API_BIND_ADDR=127.0.0.1:3000\nLISTING_SYNC_SYNC_MAX_ITEMS_PER_JOB=10\n",
    );

    unsafe {
        env::set_var("LISTING_SYNC_API_BIND_ADDR", "0.0.0.0:9090");
        env::set_var("LISTING_SYNC_SYNC_MAX_ITEMS_PER_JOB", "25");
    }

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.sync.max_items_per_job, 25);

    clear_env();
}

#[test]
fn destination_settings_and_patterns_are_parsed() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("LISTING_SYNC_PROFILE", "production");
        env::set_var(
            "LISTING_SYNC_DESTINATION_API_BASE",
            "https://api.marketplace.example/v1",
        );
        env::set_var("LISTING_SYNC_DESTINATION_API_TOKEN", "  secret-token  ");
        env::set_var("LISTING_SYNC_SYNC_RESTART_POLICY", "resume");
        env::set_var(
            "LISTING_SYNC_RATE_LIMIT_MESSAGE_PATTERNS",
            "slow down, try again later ,",
        );
    }

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("production config loads");

    assert_eq!(
        cfg.destination_api_base.as_deref(),
        Some("https://api.marketplace.example/v1")
    );
    assert_eq!(cfg.destination_api_token.as_deref(), Some("secret-token"));
    assert_eq!(cfg.sync.restart_policy, RestartPolicy::Resume);
    assert_eq!(
        cfg.rate_limit_policy.message_patterns,
        vec!["slow down".to_string(), "try again later".to_string()]
    );
    assert!(!cfg.redacted_json().unwrap().contains("secret-token"));

    clear_env();
}

#[test]
fn production_without_destination_is_rejected() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("LISTING_SYNC_PROFILE", "production");
    }
    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("missing destination should fail");
    assert!(format!("{}", err).contains("destination API base is missing"));

    clear_env();
}

#[test]
fn unknown_restart_policy_is_rejected() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("LISTING_SYNC_SYNC_RESTART_POLICY", "maybe");
    }
    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("unknown policy should fail");
    assert!(format!("{}", err).contains("restart policy"));

    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("LISTING_SYNC_API_BIND_ADDR", "not-an-addr");
    }
    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("invalid bind addr should fail");
    assert!(format!("{}", err).contains("invalid api bind address"));

    clear_env();
}
