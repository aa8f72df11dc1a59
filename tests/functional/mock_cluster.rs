//! In-memory bookie workload driven pass by pass
//!
//! Mimics what the API server and kubelet do between reconcile passes for a
//! StatefulSet with the `OnDelete` strategy: deleted pods come back from the
//! current template, new pods start on the next pass and either become ready
//! or get stuck pulling their image.

use std::collections::{BTreeMap, BTreeSet};

use bookkeeper_operator::controller::rollout::{MemberPod, RolloutFault};
use bookkeeper_operator::controller::{
    RolloutAction, Workload, plan_rollback, plan_version_sync,
};
use bookkeeper_operator::crd::{BookkeeperClusterStatus, ConditionType};

/// One simulated bookie pod
#[derive(Clone, Debug)]
pub struct SimPod {
    pub version: String,
    pub ready: bool,
    pub terminating: bool,
    pub fault: Option<String>,
}

impl SimPod {
    fn created(version: &str) -> Self {
        Self {
            version: version.to_string(),
            ready: false,
            terminating: false,
            fault: None,
        }
    }

    fn available(&self) -> bool {
        self.ready && !self.terminating
    }
}

/// What one reconcile pass did
#[derive(Clone, Debug, Default)]
pub struct PassReport {
    pub actions: Vec<RolloutAction>,
    pub faults: Vec<RolloutFault>,
    pub completed: Option<String>,
}

impl PassReport {
    pub fn deleted_pods(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a, RolloutAction::DeletePod { .. }))
            .count()
    }
}

/// A BookkeeperCluster and its workload, without an API server
pub struct SimulatedCluster {
    pub name: String,
    pub spec_version: String,
    pub replicas: usize,
    pub status: BookkeeperClusterStatus,
    pub template_version: String,
    pub pods: BTreeMap<usize, SimPod>,
    /// Versions whose image cannot be pulled
    pub broken_versions: BTreeSet<String>,
    pub passes: usize,
}

impl SimulatedCluster {
    /// A cluster whose StatefulSet was just created at `version`
    pub fn create(name: &str, version: &str, replicas: usize) -> Self {
        Self {
            name: name.to_string(),
            spec_version: version.to_string(),
            replicas,
            status: BookkeeperClusterStatus::default(),
            template_version: version.to_string(),
            pods: BTreeMap::new(),
            broken_versions: BTreeSet::new(),
            passes: 0,
        }
    }

    pub fn pod_name(&self, ordinal: usize) -> String {
        format!("{}-bookie-{}", self.name, ordinal)
    }

    pub fn break_version(&mut self, version: &str) {
        self.broken_versions.insert(version.to_string());
    }

    /// Put a running pod into a crash loop
    pub fn crash(&mut self, ordinal: usize, reason: &str) {
        if let Some(pod) = self.pods.get_mut(&ordinal) {
            pod.ready = false;
            pod.fault = Some(reason.to_string());
        }
    }

    pub fn unavailable_pods(&self) -> usize {
        self.pods.values().filter(|p| !p.available()).count()
    }

    pub fn pods_on(&self, version: &str) -> usize {
        self.pods.values().filter(|p| p.version == version).count()
    }

    /// Advance the world by one step between passes
    pub fn settle(&mut self) {
        let template = self.template_version.clone();
        let ordinals: Vec<usize> = self.pods.keys().copied().collect();
        for ordinal in ordinals {
            let Some(pod) = self.pods.get_mut(&ordinal) else {
                continue;
            };
            if pod.terminating {
                *pod = SimPod::created(&template);
            } else if !pod.ready && pod.fault.is_none() {
                if self.broken_versions.contains(&pod.version) {
                    pod.fault = Some("ImagePullBackOff".to_string());
                } else {
                    pod.ready = true;
                }
            }
        }
        for ordinal in 0..self.replicas {
            self.pods
                .entry(ordinal)
                .or_insert_with(|| SimPod::created(&template));
        }
    }

    pub fn workload(&self) -> Workload {
        let pods = self
            .pods
            .iter()
            .map(|(ordinal, pod)| MemberPod {
                name: self.pod_name(*ordinal),
                version: Some(pod.version.clone()),
                ready: pod.ready,
                terminating: pod.terminating,
                fault: pod.fault.clone(),
            })
            .collect();
        Workload::new(
            Some(self.template_version.clone()),
            i32::try_from(self.replicas).unwrap_or(i32::MAX),
            pods,
        )
    }

    fn apply(&mut self, action: &RolloutAction) {
        match action {
            RolloutAction::None => {}
            RolloutAction::ApplyTemplate { version } => {
                self.template_version = version.clone();
            }
            RolloutAction::DeletePod { name } => {
                let ordinal = self
                    .pods
                    .keys()
                    .copied()
                    .find(|o| self.pod_name(*o) == *name);
                if let Some(pod) = ordinal.and_then(|o| self.pods.get_mut(&o)) {
                    pod.terminating = true;
                }
            }
        }
    }

    /// One reconcile pass: version sync, rollback, then member status
    pub fn reconcile(&mut self) -> PassReport {
        self.passes += 1;
        self.status.init();
        let mut report = PassReport::default();

        let workload = self.workload();
        let plan = plan_version_sync(&self.spec_version, &mut self.status, &workload);
        self.apply(&plan.action);
        report.actions.push(plan.action);
        report.faults.extend(plan.fault);
        report.completed = plan.completed;

        let plan = plan_rollback(&self.spec_version, &mut self.status);
        self.apply(&plan.action);
        report.actions.push(plan.action);

        let (ready, unready): (Vec<_>, Vec<_>) = self
            .pods
            .iter()
            .map(|(ordinal, pod)| (self.pod_name(*ordinal), pod.available()))
            .partition(|(_, available)| *available);
        if ready.len() == self.replicas {
            self.status.set_pods_ready_condition_true();
        } else {
            self.status.set_pods_ready_condition_false();
        }
        self.status.set_members(
            ready.into_iter().map(|(name, _)| name).collect(),
            unready.into_iter().map(|(name, _)| name).collect(),
        );
        self.status.replicas = i32::try_from(self.replicas).unwrap_or(i32::MAX);

        report
    }

    /// Settle then reconcile
    pub fn tick(&mut self) -> PassReport {
        self.settle();
        self.reconcile()
    }

    /// Tick until `done` holds, checking rollout invariants after every pass
    pub fn run_until(
        &mut self,
        max_ticks: usize,
        mut done: impl FnMut(&SimulatedCluster) -> bool,
    ) -> Vec<PassReport> {
        let mut reports = Vec::new();
        for _ in 0..max_ticks {
            let report = self.tick();
            self.check_invariants(&report);
            reports.push(report);
            if done(self) {
                return reports;
            }
        }
        panic!(
            "cluster did not converge within {} passes: {:#?}",
            max_ticks, self.status
        );
    }

    /// Properties every pass must preserve
    pub fn check_invariants(&self, report: &PassReport) {
        assert!(report.deleted_pods() <= 1, "more than one pod replaced in a pass");

        let exclusive: Vec<_> = ConditionType::ALL
            .into_iter()
            .filter(|t| t.is_exclusive() && self.status.conditions.is_true(*t))
            .collect();
        assert!(exclusive.len() <= 1, "exclusive conditions overlap: {exclusive:?}");

        let rolling = self.status.is_cluster_in_upgrading_state()
            || self.status.is_cluster_in_rollback_state();
        assert_eq!(
            !self.status.target_version.is_empty(),
            rolling,
            "target version must be set exactly while a rollout is active"
        );
    }
}
