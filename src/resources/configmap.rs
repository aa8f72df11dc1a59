//! Bookie ConfigMap generation
//!
//! Everything the bookie entrypoint reads from its environment: JVM flags,
//! the ZooKeeper address and `bk_server.conf` overrides as `BK_<key>`.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use semver::Version;

use crate::controller::validation::normalize_version;
use crate::crd::BookkeeperCluster;
use crate::resources::common::{cluster_labels, config_map_name, owner_reference};

/// Where the JVM writes heap dumps on OOM
pub const HEAP_DUMP_DIR: &str = "/tmp/dumpfile/heap";

/// Versions below this run BookKeeper 4.5, which misbehaves with hostname bookie IDs
const HOSTNAME_BOOKIE_ID_SINCE: Version = Version::new(0, 5, 0);

fn default_memory_opts() -> Vec<String> {
    vec![
        "-Xms1g".to_string(),
        "-XX:MaxDirectMemorySize=1g".to_string(),
        "-XX:+ExitOnOutOfMemoryError".to_string(),
        "-XX:+CrashOnOutOfMemoryError".to_string(),
        "-XX:+HeapDumpOnOutOfMemoryError".to_string(),
        format!("-XX:HeapDumpPath={}", HEAP_DUMP_DIR),
        "-XX:+UnlockExperimentalVMOptions".to_string(),
        "-XX:+UseContainerSupport".to_string(),
        "-XX:MaxRAMPercentage=50.0".to_string(),
    ]
}

fn default_gc_opts() -> Vec<String> {
    [
        "-XX:+UseG1GC",
        "-XX:MaxGCPauseMillis=10",
        "-XX:+ParallelRefProcEnabled",
        "-XX:+AggressiveOpts",
        "-XX:+DoEscapeAnalysis",
        "-XX:ParallelGCThreads=32",
        "-XX:ConcGCThreads=32",
        "-XX:G1NewSizePercent=50",
        "-XX:+DisableExplicitGC",
        "-XX:-ResizePLAB",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Identity of a JVM flag, ignoring its value.
///
/// `-XX:+UseG1GC` and `-XX:-UseG1GC` share the key `-XX:UseG1GC`,
/// `-XX:MaxGCPauseMillis=10` has key `-XX:MaxGCPauseMillis`, and sizing flags
/// such as `-Xms1g` are keyed by their four-character prefix.
pub fn jvm_option_key(option: &str) -> String {
    if let Some(rest) = option.strip_prefix("-XX:") {
        let rest = rest.trim_start_matches(['+', '-']);
        let name = rest.split_once('=').map_or(rest, |(name, _)| name);
        return format!("-XX:{}", name);
    }
    for prefix in ["-Xms", "-Xmx", "-Xss", "-Xmn"] {
        if option.starts_with(prefix) {
            return prefix.to_string();
        }
    }
    option
        .split_once('=')
        .map_or(option, |(name, _)| name)
        .to_string()
}

/// Apply user JVM flags over defaults.
///
/// A user flag with the same key as a default replaces it in place; the rest
/// are appended in the order given.
pub fn override_jvm_options(defaults: Vec<String>, custom: &[String]) -> Vec<String> {
    let mut merged = defaults;
    for option in custom {
        let key = jvm_option_key(option);
        match merged.iter_mut().find(|o| jvm_option_key(o) == key) {
            Some(existing) => *existing = option.clone(),
            None => merged.push(option.clone()),
        }
    }
    merged
}

/// `BK_useHostNameAsBookieID` for a version; unparseable versions get the modern default
fn use_hostname_as_bookie_id(version: &str) -> bool {
    normalize_version(version)
        .ok()
        .and_then(|v| Version::parse(&v).ok())
        .is_none_or(|v| v >= HOSTNAME_BOOKIE_ID_SINCE)
}

/// Build the ConfigMap data for a cluster
pub fn config_map_data(cluster: &BookkeeperCluster) -> BTreeMap<String, String> {
    let jvm = cluster.spec.jvm_options.clone().unwrap_or_default();
    let memory_opts = override_jvm_options(default_memory_opts(), &jvm.memory_opts);
    let gc_opts = override_jvm_options(default_gc_opts(), &jvm.gc_opts);

    let mut data = BTreeMap::from([
        ("BOOKIE_MEM_OPTS".to_string(), memory_opts.join(" ")),
        ("BOOKIE_GC_OPTS".to_string(), gc_opts.join(" ")),
        (
            "BOOKIE_GC_LOGGING_OPTS".to_string(),
            jvm.gc_logging_opts.join(" "),
        ),
        ("BOOKIE_EXTRA_OPTS".to_string(), jvm.extra_opts.join(" ")),
        ("ZK_URL".to_string(), cluster.spec.zookeeper_uri.clone()),
        (
            "BK_useHostNameAsBookieID".to_string(),
            use_hostname_as_bookie_id(&cluster.spec.version).to_string(),
        ),
    ]);

    if cluster.spec.auto_recovery.unwrap_or(true) {
        data.insert("BK_autoRecoveryDaemonEnabled".to_string(), "true".to_string());
        // Give bookies a minute to come back after an update before re-replicating
        data.insert("BK_lostBookieRecoveryDelay".to_string(), "60".to_string());
    } else {
        data.insert(
            "BK_autoRecoveryDaemonEnabled".to_string(),
            "false".to_string(),
        );
    }

    for (key, value) in &cluster.spec.options {
        data.insert(format!("BK_{}", key), value.clone());
    }

    data
}

/// Generate the bookie ConfigMap
pub fn generate_config_map(cluster: &BookkeeperCluster) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name(&cluster.name_any())),
            namespace: cluster.namespace(),
            labels: Some(cluster_labels(&cluster.name_any())),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        data: Some(config_map_data(cluster)),
        ..Default::default()
    }
}

/// True when the live ConfigMap carries different data than `desired`
pub fn config_map_changed(live: &ConfigMap, desired: &ConfigMap) -> bool {
    live.data.clone().unwrap_or_default() != desired.data.clone().unwrap_or_default()
}
