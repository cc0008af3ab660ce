use super::*;

fn raw_experiment(name: &str, labels: &[&str]) -> RawExperiment {
    RawExperiment {
        name: name.to_string(),
        variants: labels
            .iter()
            .map(|label| RawVariant {
                label: (*label).to_string(),
                weight: None,
            })
            .collect(),
    }
}

#[test]
fn defaults_resolve_without_any_source() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.public_addr.port(), DEFAULT_PUBLIC_PORT);
    assert_eq!(settings.server.admin_addr.port(), DEFAULT_ADMIN_PORT);
    assert!(settings.cache.enabled);
    assert_eq!(settings.cache.max_bytes.get(), 256 * 1024 * 1024);
    assert_eq!(settings.cache.max_age, Duration::from_secs(90));
    assert_eq!(settings.leak_monitor.max_in_flight.get(), 500);
    assert_eq!(
        settings.metrics.health_check_user_agent,
        DEFAULT_HEALTH_CHECK_USER_AGENT
    );
    assert_eq!(
        settings.bypass.excluded_path_prefixes,
        vec!["/editPost".to_string(), "/collaborateOnPost".to_string()]
    );
    assert_eq!(settings.bypass.auth_cookie, "loginToken");
    assert!(settings.origin.url.is_none());
    assert!(settings.experiments.is_empty());
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.public_port = Some(4000);
    raw.logging.level = Some("info".to_string());
    raw.cache.max_age_seconds = Some(120);

    let overrides = ServeOverrides {
        public_port: Some(4321),
        log_level: Some("debug".to_string()),
        cache_max_age_seconds: Some(15),
        origin_url: Some("http://127.0.0.1:8080".to_string()),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.public_addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.cache.max_age, Duration::from_secs(15));
    assert_eq!(
        settings.origin.url.as_ref().map(Url::as_str),
        Some("http://127.0.0.1:8080/")
    );
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn zero_sizes_and_intervals_are_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.max_bytes = Some(0);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "cache.max_bytes",
            ..
        })
    ));

    let mut raw = RawSettings::default();
    raw.cache.max_age_seconds = Some(0);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "cache.max_age_seconds",
            ..
        })
    ));

    let mut raw = RawSettings::default();
    raw.leak_monitor.max_variants = Some(0);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "leak_monitor.max_variants",
            ..
        })
    ));
}

#[test]
fn unparsable_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "logging.level",
            ..
        })
    ));
}

#[test]
fn origin_url_must_be_http() {
    let mut raw = RawSettings::default();
    raw.origin.url = Some("ftp://origin.internal".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "origin.url",
            ..
        })
    ));
}

#[test]
fn experiments_are_validated() {
    let mut raw = RawSettings::default();
    raw.experiments = vec![
        raw_experiment("buttonColor", &["red", "blue"]),
        raw_experiment("layout", &["A", "B"]),
    ];
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.experiments.len(), 2);
    assert_eq!(settings.experiments[0].variants[0].weight, 1);

    let mut raw = RawSettings::default();
    raw.experiments = vec![raw_experiment("empty", &[])];
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "experiments",
            ..
        })
    ));

    let mut raw = RawSettings::default();
    raw.experiments = vec![
        raw_experiment("layout", &["A", "B"]),
        raw_experiment("layout", &["A", "C"]),
    ];
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "experiments",
            ..
        })
    ));

    let mut raw = RawSettings::default();
    raw.experiments = vec![raw_experiment("layout", &["A", "A"])];
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "experiments.variants.label",
            ..
        })
    ));
}

#[test]
fn experiment_names_and_labels_must_fit_the_allocation_header() {
    let mut raw = RawSettings::default();
    raw.experiments = vec![raw_experiment("a=b", &["x"])];
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "experiments.name",
            ..
        })
    ));

    for label in ["x;y", "a,b", "new\nline", "two words"] {
        let mut raw = RawSettings::default();
        raw.experiments = vec![raw_experiment("layout", &["A", label])];
        assert!(
            matches!(
                Settings::from_raw(raw),
                Err(LoadError::Invalid {
                    key: "experiments.variants.label",
                    ..
                })
            ),
            "label {label:?} should be rejected"
        );
    }
}

#[test]
fn excluded_prefixes_must_be_paths() {
    let mut raw = RawSettings::default();
    raw.bypass.excluded_path_prefixes = Some(vec!["editPost".to_string()]);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "bypass.excluded_path_prefixes",
            ..
        })
    ));
}

#[test]
fn cache_config_follows_settings() {
    let mut raw = RawSettings::default();
    raw.cache.enabled = Some(false);
    raw.leak_monitor.max_base_keys = Some(7);
    raw.metrics.health_check_user_agent = Some("probe".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");

    let config = crate::cache::CacheConfig::from(&settings);
    assert!(!config.enabled);
    assert_eq!(config.leak.max_base_keys, 7);
    assert_eq!(config.health_check_user_agent, "probe");
    assert_eq!(
        config.bypass.user_agent_prefixes,
        vec!["Slackbot-LinkExpanding".to_string()]
    );
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["render-cache"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "render-cache",
        "serve",
        "--server-host",
        "0.0.0.0",
        "--origin-url",
        "http://origin:8080",
        "--cache-enabled",
        "false",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
            assert_eq!(
                serve.overrides.origin_url.as_deref(),
                Some("http://origin:8080")
            );
            assert_eq!(serve.overrides.cache_enabled, Some(false));
        }
    }
}
