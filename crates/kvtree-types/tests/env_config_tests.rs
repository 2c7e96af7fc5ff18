use kvtree_types::*;

const VARS: [&str; 6] = [
    "KVTREE_PAGE_SIZE",
    "KVTREE_EVICTION_POLICY",
    "KVTREE_POOL_PAGES",
    "KVTREE_SCHEDULE_POLICY",
    "KVTREE_REQUEST_TIMEOUT_SECS",
    "KVTREE_LOG_FORMAT",
];

fn clear_env() {
    for var in VARS {
        std::env::remove_var(var);
    }
}

// Single test so nothing else in this binary races on the environment
#[test]
fn config_from_env_reads_and_validates_overrides() {
    clear_env();
    assert_eq!(KvTreeConfig::from_env().unwrap(), KvTreeConfig::default());

    std::env::set_var("KVTREE_PAGE_SIZE", "4");
    std::env::set_var("KVTREE_EVICTION_POLICY", "FIFO");
    std::env::set_var("KVTREE_POOL_PAGES", "512");
    std::env::set_var("KVTREE_SCHEDULE_POLICY", "fcfs");
    std::env::set_var("KVTREE_REQUEST_TIMEOUT_SECS", "30");
    std::env::set_var("KVTREE_LOG_FORMAT", "json");

    let config = KvTreeConfig::from_env().unwrap();
    assert_eq!(config.cache.page_size, 4);
    assert_eq!(config.cache.eviction_policy, EvictionPolicyKind::Fifo);
    assert_eq!(config.pool.max_pages, 512);
    assert_eq!(config.scheduler.policy, SchedulePolicy::Fcfs);
    assert_eq!(config.scheduler.request_timeout_secs, Some(30));
    assert_eq!(config.logging.format, "json");

    std::env::set_var("KVTREE_PAGE_SIZE", "four");
    let err = KvTreeConfig::from_env().unwrap_err();
    assert!(matches!(err, KvTreeError::Config { .. }));

    std::env::set_var("KVTREE_PAGE_SIZE", "0");
    assert!(KvTreeConfig::from_env().is_err());

    clear_env();
}
