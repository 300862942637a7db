use arbitrary::{Arbitrary, Unstructured};
use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::fs;

use super::*;

#[test]
fn test_config_default() {
    let dir = std::env::temp_dir().join("test_config_default");
    let config = Config::new(&dir);
    assert_eq!(config.cluster_id, CLUSTER_ID);
    assert_eq!(config.commit_interval, COMMIT_INTERVAL);
    assert!(config.pool_size >= 1);
    assert_eq!(config.to_user_log_dir(), dir.join("log").join("user"));
    assert_eq!(config.to_system_log_dir(), dir.join("log").join("system"));

    let mut config = config;
    config
        .set_pool_size(0)
        .set_busy_retry(2, time::Duration::from_millis(1))
        .set_query_cache_size(0);
    assert_eq!(config.pool_size, 1);
    assert_eq!(config.busy_retry_limit, 2);
    assert_eq!(config.query_cache_size, 0);
}

#[test]
fn test_config_arbitrary() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_config_arbitrary {}", seed);

    for _ in 0..100 {
        let bytes = rng.gen::<[u8; 32]>();
        let mut uns = Unstructured::new(&bytes);
        let config: Config = uns.arbitrary().unwrap();
        assert!(config.pool_size >= 1);
        assert!(config.coalesce_limit >= 1024);
    }
}

#[test]
fn test_config_toml() {
    let dir = std::env::temp_dir().join("test_config_toml");
    fs::remove_dir_all(&dir).ok();
    fs::create_dir_all(&dir).unwrap();

    let loc = dir.join("rangesrv.toml");
    let text = r#"
dir = "/var/lib/rangesrv"
cluster_id = 7
commit_interval = 5
busy_retry_limit = 3
pool_size = 2

[commit_log]
roll_limit = 4096
compressor = "zstd"
"#;
    fs::write(&loc, text).unwrap();

    let config = Config::from_toml(&loc).unwrap();
    assert_eq!(config.dir, path::PathBuf::from("/var/lib/rangesrv"));
    assert_eq!(config.cluster_id, 7);
    assert_eq!(config.commit_interval, time::Duration::from_millis(5));
    assert_eq!(config.busy_retry_limit, 3);
    assert_eq!(config.pool_size, 2);
    assert_eq!(config.commit_log.roll_limit, 4096);
    assert_eq!(config.commit_log.compressor, CompressionType::Zstd);
    assert_eq!(config.request_timeout, REQUEST_TIMEOUT);

    fs::write(&loc, "cluster_id = 7\n").unwrap();
    assert!(Config::from_toml(&loc).is_err());

    fs::write(&loc, "dir = \"/tmp\"\n[commit_log]\ncompressor = \"snappy\"\n").unwrap();
    match Config::from_toml(&loc) {
        Err(Error::UnsupportedType(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
}
