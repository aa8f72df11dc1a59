//! Bookie StatefulSet generation
//!
//! The StatefulSet uses the `OnDelete` update strategy: Kubernetes never
//! replaces a bookie on its own after a template change. Pods are replaced
//! by the operator one at a time, either by the rollout engine (version
//! changes) or by the restart sweep (configuration changes).
//!
//! The pod template carries the [`VERSION_ANNOTATION`] and
//! [`TEMPLATE_HASH_ANNOTATION`] annotations. Pods copy them at creation, so
//! they record which version and which template plus bookie configuration
//! each pod was built from even while the template is being changed
//! underneath it.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMapEnvSource, Container, ContainerPort, EmptyDirVolumeSource, EnvFromSource,
    ExecAction, HostPathVolumeSource, PersistentVolumeClaim, PodAffinityTerm, PodAntiAffinity,
    PodSpec, PodTemplateSpec, Probe as K8sProbe, Volume, VolumeMount, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::ResourceExt;
use kube::core::ObjectMeta;
use sha2::{Digest, Sha256};

use crate::crd::{BookkeeperCluster, Probe, image_for};
use crate::resources::common::{
    BOOKIE_COMPONENT, BOOKIE_PORT, CLUSTER_LABEL, COMPONENT_LABEL, TEMPLATE_HASH_ANNOTATION,
    VERSION_ANNOTATION, bookie_labels, bookie_selector_labels, config_map_name, headless_service_name,
    owner_reference, statefulset_name,
};
use crate::resources::configmap::{HEAP_DUMP_DIR, config_map_data};

pub const LEDGER_DISK_NAME: &str = "ledger";
pub const JOURNAL_DISK_NAME: &str = "journal";
pub const INDEX_DISK_NAME: &str = "index";
pub const HEAP_DUMP_VOLUME: &str = "heap-dump";
pub const BOOKIE_CONTAINER: &str = "bookie";

const DEFAULT_LEDGER_DIR: &str = "/bk/ledgers";
const DEFAULT_JOURNAL_DIR: &str = "/bk/journal";
const DEFAULT_INDEX_DIR: &str = "/bk/index";

const READINESS_COMMAND: &str = "/opt/bookkeeper/bin/bookkeeper shell bookiesanity";

/// Liveness check: something is listening on the bookie port
fn healthcheck_command(port: i32) -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!(
            "netstat -ltn 2> /dev/null | grep {port} || ss -ltn 2> /dev/null | grep {port}"
        ),
    ]
}

/// Generate the bookie StatefulSet at the version requested in the spec
pub fn generate_statefulset(cluster: &BookkeeperCluster) -> StatefulSet {
    let cluster_name = cluster.name_any();
    let owner = owner_reference(cluster);

    let volume_claim_templates = volume_claim_templates(cluster)
        .into_iter()
        .map(|mut pvc| {
            pvc.metadata.owner_references = Some(vec![owner.clone()]);
            pvc
        })
        .collect();

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(statefulset_name(&cluster_name)),
            namespace: cluster.namespace(),
            labels: Some(bookie_labels(cluster)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            service_name: Some(headless_service_name(&cluster_name)),
            replicas: Some(cluster.spec.replicas),
            pod_management_policy: Some("Parallel".to_string()),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("OnDelete".to_string()),
                ..Default::default()
            }),
            selector: LabelSelector {
                match_labels: Some(bookie_selector_labels(&cluster_name)),
                ..Default::default()
            },
            template: pod_template(cluster, &cluster.spec.version),
            volume_claim_templates: Some(volume_claim_templates),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pod template running `version`
///
/// The rollout engine builds the template for its target version, which can
/// differ from `spec.version` while rolling back.
pub fn pod_template(cluster: &BookkeeperCluster, version: &str) -> PodTemplateSpec {
    let mut annotations = BTreeMap::from([(VERSION_ANNOTATION.to_string(), version.to_string())]);
    let mut template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(bookie_labels(cluster)),
            annotations: Some(annotations.clone()),
            ..Default::default()
        }),
        spec: Some(pod_spec(cluster, version)),
    };

    annotations.insert(
        TEMPLATE_HASH_ANNOTATION.to_string(),
        template_hash(&template, &config_map_data(cluster)),
    );
    if let Some(metadata) = template.metadata.as_mut() {
        metadata.annotations = Some(annotations);
    }
    template
}

/// SHA-256 over a pod template and the bookie configuration its pods read.
///
/// Bookies only read the ConfigMap at startup, so a configuration change
/// changes the hash just like a template change does.
pub fn template_hash(template: &PodTemplateSpec, config: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(template).unwrap_or_default());
    hasher.update(serde_json::to_vec(config).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}

/// Version recorded on a pod template or pod
pub fn recorded_version(metadata: &ObjectMeta) -> Option<&str> {
    annotation(metadata, VERSION_ANNOTATION)
}

/// Template hash recorded on a pod template or pod
pub fn recorded_template_hash(metadata: &ObjectMeta) -> Option<&str> {
    annotation(metadata, TEMPLATE_HASH_ANNOTATION)
}

fn annotation<'a>(metadata: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

fn pod_spec(cluster: &BookkeeperCluster, version: &str) -> PodSpec {
    let spec = &cluster.spec;
    let cluster_name = cluster.name_any();

    let mut env_from = vec![config_map_env(&config_map_name(&cluster_name))];
    if let Some(name) = spec.env_vars_config_map() {
        env_from.push(config_map_env(name));
    }

    let layout = DirectoryLayout::from_options(&spec.options);
    let probes = spec.probes.clone().unwrap_or_default();
    let readiness = probes
        .readiness_probe
        .unwrap_or_else(Probe::default_readiness);
    let liveness = probes.liveness_probe.unwrap_or_else(Probe::default_liveness);

    PodSpec {
        containers: vec![Container {
            name: BOOKIE_CONTAINER.to_string(),
            image: Some(image_for(spec.image_repository(), version)),
            image_pull_policy: spec
                .image
                .as_ref()
                .map(|i| i.pull_policy.clone())
                .filter(|p| !p.is_empty()),
            ports: Some(vec![ContainerPort {
                name: Some("bookie".to_string()),
                container_port: BOOKIE_PORT,
                ..Default::default()
            }]),
            env_from: Some(env_from),
            volume_mounts: Some(layout.volume_mounts()),
            resources: spec.resources.clone(),
            readiness_probe: Some(exec_probe(
                vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    READINESS_COMMAND.to_string(),
                ],
                &readiness,
            )),
            liveness_probe: Some(exec_probe(healthcheck_command(BOOKIE_PORT), &liveness)),
            ..Default::default()
        }],
        affinity: Some(pod_anti_affinity(BOOKIE_COMPONENT, &cluster_name)),
        volumes: Some(layout.volumes()),
        service_account_name: spec
            .service_account_name
            .clone()
            .filter(|s| !s.is_empty()),
        ..Default::default()
    }
}

fn config_map_env(name: &str) -> EnvFromSource {
    EnvFromSource {
        config_map_ref: Some(ConfigMapEnvSource {
            name: name.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn exec_probe(command: Vec<String>, timings: &Probe) -> K8sProbe {
    K8sProbe {
        exec: Some(ExecAction {
            command: Some(command),
        }),
        initial_delay_seconds: Some(timings.initial_delay_seconds),
        period_seconds: Some(timings.period_seconds),
        failure_threshold: Some(timings.failure_threshold),
        success_threshold: Some(timings.success_threshold),
        timeout_seconds: Some(timings.timeout_seconds),
        ..Default::default()
    }
}

/// Prefer spreading bookies of one cluster across nodes
fn pod_anti_affinity(component: &str, cluster_name: &str) -> Affinity {
    let requirement = |key: &str, value: &str| LabelSelectorRequirement {
        key: key.to_string(),
        operator: "In".to_string(),
        values: Some(vec![value.to_string()]),
    };

    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 100,
                    pod_affinity_term: PodAffinityTerm {
                        label_selector: Some(LabelSelector {
                            match_expressions: Some(vec![
                                requirement(COMPONENT_LABEL, component),
                                requirement(CLUSTER_LABEL, cluster_name),
                            ]),
                            ..Default::default()
                        }),
                        topology_key: "kubernetes.io/hostname".to_string(),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Claim templates in journal, ledger, index order
fn volume_claim_templates(cluster: &BookkeeperCluster) -> Vec<PersistentVolumeClaim> {
    let storage = cluster.spec.storage.clone().unwrap_or_default();
    [
        (JOURNAL_DISK_NAME, storage.journal_volume_claim_template),
        (LEDGER_DISK_NAME, storage.ledger_volume_claim_template),
        (INDEX_DISK_NAME, storage.index_volume_claim_template),
    ]
    .into_iter()
    .map(|(name, spec)| PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: cluster.namespace(),
            ..Default::default()
        },
        spec,
        ..Default::default()
    })
    .collect()
}

/// Data directories and extra volumes configured through bookie options
#[derive(Debug, Clone, PartialEq)]
struct DirectoryLayout {
    disks: Vec<DiskLayout>,
    host_path_mounts: Vec<(String, String)>,
    empty_dir_mounts: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
struct DiskLayout {
    volume: &'static str,
    directories: Vec<String>,
    sub_path: String,
}

impl DirectoryLayout {
    fn from_options(options: &BTreeMap<String, String>) -> Self {
        let disk = |volume: &'static str, dirs_key: &str, sub_path_key: &str, default: &str| {
            DiskLayout {
                volume,
                directories: options
                    .get(dirs_key)
                    .map(|d| split_list(d))
                    .filter(|d| !d.is_empty())
                    .unwrap_or_else(|| vec![default.to_string()]),
                sub_path: options
                    .get(sub_path_key)
                    .cloned()
                    .unwrap_or_else(|| volume.to_string()),
            }
        };

        Self {
            disks: vec![
                disk(LEDGER_DISK_NAME, "ledgerDirectories", "ledgerSubPath", DEFAULT_LEDGER_DIR),
                disk(JOURNAL_DISK_NAME, "journalDirectories", "journalSubPath", DEFAULT_JOURNAL_DIR),
                disk(INDEX_DISK_NAME, "indexDirectories", "indexSubPath", DEFAULT_INDEX_DIR),
            ],
            host_path_mounts: named_paths(options.get("hostPathVolumeMounts")),
            empty_dir_mounts: named_paths(options.get("emptyDirVolumeMounts")),
        }
    }

    fn volume_mounts(&self) -> Vec<VolumeMount> {
        let mut mounts = Vec::new();
        for disk in &self.disks {
            // Several directories on one volume each get their own sub path
            let multiple = disk.directories.len() > 1;
            for (i, dir) in disk.directories.iter().enumerate() {
                mounts.push(VolumeMount {
                    name: disk.volume.to_string(),
                    mount_path: dir.clone(),
                    sub_path: multiple.then(|| format!("{}{}", disk.sub_path, i)),
                    ..Default::default()
                });
            }
        }
        for (name, path) in self.host_path_mounts.iter().chain(&self.empty_dir_mounts) {
            mounts.push(VolumeMount {
                name: name.clone(),
                mount_path: path.clone(),
                ..Default::default()
            });
        }
        if self.empty_dir_mounts.is_empty() {
            mounts.push(VolumeMount {
                name: HEAP_DUMP_VOLUME.to_string(),
                mount_path: HEAP_DUMP_DIR.to_string(),
                ..Default::default()
            });
        }
        mounts
    }

    fn volumes(&self) -> Vec<Volume> {
        let mut volumes: Vec<Volume> = self
            .host_path_mounts
            .iter()
            .map(|(name, path)| Volume {
                name: name.clone(),
                host_path: Some(HostPathVolumeSource {
                    path: path.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect();

        let empty_dirs: Vec<&str> = if self.empty_dir_mounts.is_empty() {
            vec![HEAP_DUMP_VOLUME]
        } else {
            self.empty_dir_mounts.iter().map(|(n, _)| n.as_str()).collect()
        };
        volumes.extend(empty_dirs.into_iter().map(|name| Volume {
            name: name.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }));
        volumes
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Parse `name=path,name=path`; entries without `=` are ignored
fn named_paths(value: Option<&String>) -> Vec<(String, String)> {
    value
        .map(|v| split_list(v))
        .unwrap_or_default()
        .into_iter()
        .filter_map(|entry| {
            entry
                .split_once('=')
                .map(|(name, path)| (name.to_string(), path.to_string()))
        })
        .collect()
}
