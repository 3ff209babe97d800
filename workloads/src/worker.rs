//! Workers: the jobs executing runs.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job as KubeJob;
use k8s_openapi::api::batch::v1::JobSpec;
use k8s_openapi::api::core::v1::Affinity;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::api::core::v1::EnvVarSource;
use k8s_openapi::api::core::v1::NodeAffinity;
use k8s_openapi::api::core::v1::NodeSelector;
use k8s_openapi::api::core::v1::NodeSelectorRequirement;
use k8s_openapi::api::core::v1::NodeSelectorTerm;
use k8s_openapi::api::core::v1::ObjectFieldSelector;
use k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::api::core::v1::PreferredSchedulingTerm;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::api::core::v1::SecretVolumeSource;
use k8s_openapi::api::core::v1::Toleration;
use k8s_openapi::api::core::v1::Volume;
use k8s_openapi::api::core::v1::VolumeMount;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use knitfab_cluster::Backoff;
use knitfab_cluster::Cluster;
use knitfab_cluster::ClusterResult;
use knitfab_cluster::Handle;
use knitfab_cluster::Job;
use knitfab_cluster::JobStatus;
use knitfab_cluster::LogStream;
use knitfab_domain::Assignment;
use knitfab_domain::ClusterConfig;
use knitfab_domain::ImageIdentifier;
use knitfab_domain::MountPoint;
use knitfab_domain::OnNode;
use knitfab_domain::OnNodeMode;
use knitfab_domain::Run;
use knitfab_domain::RunBody;
use tokio_util::sync::CancellationToken;

use crate::Error;
use crate::MetaSource;
use crate::ResourceBuilder;
use crate::WorkloadResult;

/// The name of the container running the plan's image.
pub const MAIN_CONTAINER: &str = "main";

/// The name of the init container preparing output mounts.
const INIT_MAIN_CONTAINER: &str = "init-main";

/// The name of the init container preparing the log mount.
const INIT_LOG_CONTAINER: &str = "init-log";

/// The name of the sidecar recording the main container's log.
const NURSE_CONTAINER: &str = "nurse";

/// The path the log volume is mounted at.
const LOG_PATH: &str = "/log";

/// The name of the log file in the log volume.
const LOG_FILE: &str = "log";

/// The name of the volume holding the nurse's service account token.
const SERVICE_ACCOUNT_VOLUME: &str = "serviceaccount";

/// The path service account tokens are mounted at.
const SERVICE_ACCOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// The CPU limit of the auxiliary containers.
const AUXILIARY_CPU_LIMIT: &str = "50m";

/// The memory limit of the auxiliary containers.
const AUXILIARY_MEMORY_LIMIT: &str = "100Mi";

/// The polling interval while spawning or finding a worker.
const WORKER_INTERVAL: Duration = Duration::from_secs(3);

/// Identifies the worker of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentifier {
    /// The identity of the run.
    body: RunBody,
}

impl RunIdentifier {
    /// Constructs a new run identifier.
    pub fn new(body: RunBody) -> Self {
        Self { body }
    }
}

impl MetaSource for RunIdentifier {
    fn component(&self) -> &str {
        "worker"
    }

    fn instance(&self) -> &str {
        &self.body.worker_name
    }

    fn id(&self) -> &str {
        &self.body.id
    }

    fn id_type(&self) -> &str {
        "runid"
    }

    fn extras(&self) -> BTreeMap<String, String> {
        BTreeMap::from_iter([("run".to_string(), self.body.id.clone())])
    }
}

/// A run validated for execution.
///
/// Building an executable yields the job of the run's worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executable {
    /// The identity of the run.
    run: RunIdentifier,
    /// The environment of the main container.
    env: BTreeMap<String, String>,
    /// The image of the plan.
    image: ImageIdentifier,
    /// The inputs of the run.
    inputs: Vec<Assignment>,
    /// The outputs of the run.
    outputs: Vec<Assignment>,
    /// The log of the run, mounted at `/log`.
    log: Option<Assignment>,
}

impl Executable {
    /// Validates a run for execution.
    ///
    /// Every input and output needs a mount path, a knit id and a volume
    /// ref; the log needs a knit id and a volume ref. No two outputs (or an
    /// output and the log) may share a knit id.
    pub fn new(run: &Run, env: BTreeMap<String, String>) -> WorkloadResult<Self> {
        let plan = &run.body.plan;
        let malformed = |reason: String| Error::MalformedRun {
            plan_id: plan.plan_id.clone(),
            run_id: run.body.id.clone(),
            reason,
        };

        let image = match &plan.image {
            Some(image) if !image.image.is_empty() && !image.version.is_empty() => image.clone(),
            _ => return Err(malformed("no image or no version".to_string())),
        };

        for (kind, assignments) in [("input", &run.inputs), ("output", &run.outputs)] {
            for a in assignments {
                let id = a.mount_point.id;
                if a.mount_point.path.is_empty() {
                    return Err(malformed(format!("{kind} {id} has no mount path")));
                }

                if a.data.knit_id.is_empty() {
                    return Err(malformed(format!("{kind} {id} has no knit id")));
                }

                if a.data.volume_ref.is_empty() {
                    return Err(malformed(format!(
                        "{kind} {id}: data `{knit_id}` has no volume ref",
                        knit_id = a.data.knit_id
                    )));
                }
            }
        }

        let log = match &run.log {
            Some(log) => {
                if log.data.knit_id.is_empty() {
                    return Err(malformed("log has no knit id".to_string()));
                }

                if log.data.volume_ref.is_empty() {
                    return Err(malformed(format!(
                        "log: data `{knit_id}` has no volume ref",
                        knit_id = log.data.knit_id
                    )));
                }

                Some(Assignment {
                    mount_point: MountPoint {
                        id: log.id,
                        path: LOG_PATH.to_string(),
                    },
                    data: log.data.clone(),
                })
            }
            None => None,
        };

        let mut written = BTreeSet::new();
        for data in run.outputs.iter().chain(log.iter()).map(|a| &a.data) {
            if !written.insert(data.knit_id.as_str()) {
                return Err(malformed(format!(
                    "knit id `{knit_id}` is assigned more than once",
                    knit_id = data.knit_id
                )));
            }
        }

        Ok(Self {
            run: RunIdentifier::new(run.body.clone()),
            env,
            image,
            inputs: run.inputs.clone(),
            outputs: run.outputs.clone(),
            log,
        })
    }

    /// Builds the main container.
    fn main_container(&self, inputs: &[VolumeMount], outputs: &[VolumeMount]) -> Container {
        let plan = &self.run.body.plan;
        let limits: BTreeMap<String, Quantity> = plan
            .resources
            .iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect();
        let env: Vec<EnvVar> = self
            .env
            .iter()
            .map(|(k, v)| EnvVar {
                name: k.clone(),
                value: Some(v.clone()),
                ..Default::default()
            })
            .collect();

        Container {
            name: MAIN_CONTAINER.to_string(),
            image: Some(self.image.to_string()),
            command: non_empty(plan.entrypoint.clone()),
            args: non_empty(plan.args.clone()),
            env: non_empty(env),
            volume_mounts: Some(
                read_only(inputs)
                    .into_iter()
                    .chain(writable(outputs))
                    .collect(),
            ),
            resources: (!limits.is_empty()).then(|| ResourceRequirements {
                limits: Some(limits),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

impl MetaSource for Executable {
    fn component(&self) -> &str {
        self.run.component()
    }

    fn instance(&self) -> &str {
        self.run.instance()
    }

    fn id(&self) -> &str {
        self.run.id()
    }

    fn id_type(&self) -> &str {
        self.run.id_type()
    }

    fn extras(&self) -> BTreeMap<String, String> {
        let mut extras = self.run.extras();
        extras.insert("plan".to_string(), self.run.body.plan.plan_id.clone());
        extras
    }
}

impl ResourceBuilder<ClusterConfig, KubeJob> for Executable {
    fn build(&self, config: &ClusterConfig) -> KubeJob {
        let worker = &config.worker;
        let (input_volumes, inputs) = mounts(&self.inputs);
        let (output_volumes, outputs) = mounts(&self.outputs);
        let (log_volumes, logs) = mounts(self.log.as_slice());

        let mut volumes: Vec<Volume> = Vec::new();
        let mut init_containers = Vec::new();
        let mut containers = vec![self.main_container(&inputs, &outputs)];

        if !outputs.is_empty() {
            init_containers.push(Container {
                name: INIT_MAIN_CONTAINER.to_string(),
                image: Some(worker.init.image.clone()),
                args: Some(outputs.iter().map(|m| m.mount_path.clone()).collect()),
                volume_mounts: Some(read_only(&outputs)),
                resources: Some(auxiliary_resources()),
                ..Default::default()
            });
        }

        if !logs.is_empty() {
            volumes.push(Volume {
                name: SERVICE_ACCOUNT_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(worker.nurse.service_account_secret.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });

            init_containers.push(Container {
                name: INIT_LOG_CONTAINER.to_string(),
                image: Some(worker.init.image.clone()),
                args: Some(logs.iter().map(|m| m.mount_path.clone()).collect()),
                volume_mounts: Some(read_only(&logs)),
                resources: Some(auxiliary_resources()),
                ..Default::default()
            });

            let mut nurse_mounts = writable(&logs);
            nurse_mounts.push(VolumeMount {
                name: SERVICE_ACCOUNT_VOLUME.to_string(),
                mount_path: SERVICE_ACCOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            });

            containers.push(Container {
                name: NURSE_CONTAINER.to_string(),
                image: Some(worker.nurse.image.clone()),
                args: Some(
                    std::iter::once(MAIN_CONTAINER.to_string())
                        .chain(logs.iter().map(|m| format!("{path}/{LOG_FILE}", path = m.mount_path)))
                        .collect(),
                ),
                volume_mounts: Some(nurse_mounts),
                env: Some(vec![
                    field_ref("POD_NAME", "metadata.name"),
                    field_ref("NAMESPACE", "metadata.namespace"),
                ]),
                resources: Some(auxiliary_resources()),
                ..Default::default()
            });
        }

        volumes.extend(input_volumes);
        volumes.extend(output_volumes);
        volumes.extend(log_volumes);

        let plan = &self.run.body.plan;
        let tolerations = tolerations(&plan.on_node);

        KubeJob {
            metadata: self.object_meta(&config.namespace),
            spec: Some(JobSpec {
                parallelism: Some(1),
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        service_account_name: plan.service_account.clone(),
                        automount_service_account_token: Some(plan.service_account.is_some()),
                        enable_service_links: Some(false),
                        init_containers: non_empty(init_containers),
                        containers,
                        volumes: Some(volumes),
                        tolerations: non_empty(tolerations),
                        affinity: affinity(&plan.on_node),
                        priority_class_name: worker.priority.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Returns `None` for an empty vector.
fn non_empty<T>(v: Vec<T>) -> Option<Vec<T>> {
    (!v.is_empty()).then_some(v)
}

/// Builds the volumes and mounts of assignments.
///
/// Volumes are named by the knit id of the assigned data.
fn mounts(assignments: &[Assignment]) -> (Vec<Volume>, Vec<VolumeMount>) {
    assignments
        .iter()
        .map(|a| {
            let volume = Volume {
                name: a.data.knit_id.clone(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: a.data.volume_ref.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            };
            let mount = VolumeMount {
                name: a.data.knit_id.clone(),
                mount_path: a.mount_point.path.clone(),
                ..Default::default()
            };

            (volume, mount)
        })
        .unzip()
}

/// Copies mounts as read-only.
fn read_only(mounts: &[VolumeMount]) -> Vec<VolumeMount> {
    with_read_only(mounts, true)
}

/// Copies mounts as writable.
fn writable(mounts: &[VolumeMount]) -> Vec<VolumeMount> {
    with_read_only(mounts, false)
}

fn with_read_only(mounts: &[VolumeMount], read_only: bool) -> Vec<VolumeMount> {
    mounts
        .iter()
        .map(|m| VolumeMount {
            read_only: Some(read_only),
            ..m.clone()
        })
        .collect()
}

/// The resource limits of the auxiliary containers.
fn auxiliary_resources() -> ResourceRequirements {
    ResourceRequirements {
        limits: Some(BTreeMap::from_iter([
            ("cpu".to_string(), Quantity(AUXILIARY_CPU_LIMIT.to_string())),
            ("memory".to_string(), Quantity(AUXILIARY_MEMORY_LIMIT.to_string())),
        ])),
        ..Default::default()
    }
}

/// An environment variable taken from a field of the pod.
fn field_ref(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Builds the tolerations of placement rules.
///
/// Every rule tolerates `NoSchedule` taints of its label; preferred and
/// required rules also tolerate `PreferNoSchedule` taints.
fn tolerations(on_node: &[OnNode]) -> Vec<Toleration> {
    let mut tolerated = BTreeSet::new();
    for rule in on_node {
        tolerated.insert((&rule.key, &rule.value, "NoSchedule"));
        if matches!(rule.mode, OnNodeMode::Prefer | OnNodeMode::Must) {
            tolerated.insert((&rule.key, &rule.value, "PreferNoSchedule"));
        }
    }

    tolerated
        .into_iter()
        .map(|(key, value, effect)| Toleration {
            key: Some(key.clone()),
            operator: Some("Equal".to_string()),
            value: Some(value.clone()),
            effect: Some(effect.to_string()),
            ..Default::default()
        })
        .collect()
}

/// Builds the node affinity of placement rules.
///
/// Each value of a preferred rule becomes a preferred term of weight 1.
/// Required rules become a single required term: values sharing a key are
/// alternatives, distinct keys must all match.
fn affinity(on_node: &[OnNode]) -> Option<Affinity> {
    let mut preferred: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut required: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for rule in on_node {
        let rules = match rule.mode {
            OnNodeMode::May => continue,
            OnNodeMode::Prefer => &mut preferred,
            OnNodeMode::Must => &mut required,
        };

        rules.entry(&rule.key).or_default().insert(&rule.value);
    }

    if preferred.is_empty() && required.is_empty() {
        return None;
    }

    let preferred: Vec<_> = preferred
        .iter()
        .flat_map(|(key, values)| values.iter().map(move |value| (*key, *value)))
        .map(|(key, value)| PreferredSchedulingTerm {
            weight: 1,
            preference: NodeSelectorTerm {
                match_expressions: Some(vec![requirement(key, &BTreeSet::from([value]))]),
                ..Default::default()
            },
        })
        .collect();

    let required = (!required.is_empty()).then(|| NodeSelector {
        node_selector_terms: vec![NodeSelectorTerm {
            match_expressions: Some(
                required
                    .iter()
                    .map(|(key, values)| requirement(key, values))
                    .collect(),
            ),
            ..Default::default()
        }],
    });

    Some(Affinity {
        node_affinity: Some(NodeAffinity {
            preferred_during_scheduling_ignored_during_execution: non_empty(preferred),
            required_during_scheduling_ignored_during_execution: required,
        }),
        ..Default::default()
    })
}

/// Requires a node label to have one of the given values.
fn requirement(key: &str, values: &BTreeSet<&str>) -> NodeSelectorRequirement {
    NodeSelectorRequirement {
        key: key.to_string(),
        operator: "In".to_string(),
        values: Some(values.iter().map(|v| v.to_string()).collect()),
    }
}

/// The worker executing a run.
pub struct Worker {
    /// The id of the run.
    run_id: String,
    /// The job of the worker.
    job: Job,
}

impl Worker {
    /// Gets the id of the run the worker executes.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Derives the current status of the worker's job.
    pub async fn job_status(&self) -> JobStatus {
        self.job.status().await
    }

    /// Follows the log of the main container.
    pub async fn log(&self) -> WorkloadResult<LogStream> {
        Ok(self.job.log(MAIN_CONTAINER).await?)
    }
}

#[async_trait]
impl Handle for Worker {
    fn name(&self) -> &str {
        self.job.name()
    }

    fn namespace(&self) -> &str {
        self.job.namespace()
    }

    async fn close(&self) -> ClusterResult<()> {
        self.job.close().await
    }
}

/// Spawns the worker of a run.
///
/// The data the run mounts must have been provisioned already.
pub async fn spawn(
    cluster: &Cluster,
    config: &ClusterConfig,
    token: &CancellationToken,
    executable: &Executable,
) -> WorkloadResult<Worker> {
    let job = cluster
        .new_job(
            token,
            Backoff::fixed(WORKER_INTERVAL),
            executable.build(config),
            vec![],
        )
        .await?;

    Ok(Worker {
        run_id: executable.id().to_string(),
        job,
    })
}

/// Finds the worker of a run by the run's worker name.
pub async fn find(
    cluster: &Cluster,
    token: &CancellationToken,
    run: &RunBody,
) -> WorkloadResult<Worker> {
    let job = cluster
        .get_job(
            token,
            Backoff::fixed(WORKER_INTERVAL),
            &run.worker_name,
            vec![],
        )
        .await?;

    Ok(Worker {
        run_id: run.id.clone(),
        job,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::StreamExt as _;
    use k8s_openapi::api::core::v1::Pod as KubePod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use knitfab_cluster::JobState;
    use knitfab_cluster::testing::FakeKubeClient;
    use knitfab_domain::KnitDataBody;
    use knitfab_domain::LogPoint;
    use knitfab_domain::PlanBody;

    use super::*;
    use crate::tests::config;

    fn assignment(id: i32, path: &str, knit_id: &str) -> Assignment {
        Assignment {
            mount_point: MountPoint {
                id,
                path: path.into(),
            },
            data: KnitDataBody::new(knit_id, format!("pvc-{knit_id}")),
        }
    }

    fn run() -> Run {
        Run {
            body: RunBody {
                id: "run-1".into(),
                worker_name: "worker-run-1".into(),
                plan: PlanBody {
                    plan_id: "plan-1".into(),
                    image: Some(ImageIdentifier {
                        image: "example.com/train".into(),
                        version: "v1".into(),
                    }),
                    entrypoint: vec!["python".into()],
                    args: vec!["main.py".into()],
                    resources: BTreeMap::from_iter([
                        ("cpu".to_string(), "1".to_string()),
                        ("memory".to_string(), "1Gi".to_string()),
                    ]),
                    ..Default::default()
                },
            },
            inputs: vec![
                assignment(1, "/in/1", "in-1"),
                assignment(2, "/in/2", "in-2"),
            ],
            outputs: vec![
                assignment(3, "/out/1", "out-1"),
                assignment(4, "/out/2", "out-2"),
            ],
            log: Some(LogPoint {
                id: 5,
                data: KnitDataBody::new("log-1", "pvc-log-1"),
            }),
        }
    }

    fn pod_spec(job: &KubeJob) -> &PodSpec {
        job.spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .unwrap()
    }

    fn container<'a>(containers: &'a [Container], name: &str) -> &'a Container {
        containers.iter().find(|c| c.name == name).unwrap()
    }

    /// Gets the name, path and read-only flag of a container's mounts.
    fn mounts_of(container: &Container) -> Vec<(&str, &str, bool)> {
        container
            .volume_mounts
            .iter()
            .flatten()
            .map(|m| {
                (
                    m.name.as_str(),
                    m.mount_path.as_str(),
                    m.read_only.unwrap_or_default(),
                )
            })
            .collect()
    }

    fn malformed_reason(run: &Run) -> String {
        match Executable::new(run, BTreeMap::new()) {
            Err(Error::MalformedRun { reason, .. }) => reason,
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("the run should be malformed"),
        }
    }

    #[test]
    fn runs_without_paths_or_data_are_malformed() {
        let mut r = run();
        r.inputs[1].mount_point.path.clear();
        assert_eq!(malformed_reason(&r), "input 2 has no mount path");

        let mut r = run();
        r.outputs[0].data.knit_id.clear();
        assert_eq!(malformed_reason(&r), "output 3 has no knit id");

        let mut r = run();
        r.outputs[1].data.volume_ref.clear();
        assert_eq!(
            malformed_reason(&r),
            "output 4: data `out-2` has no volume ref"
        );

        let mut r = run();
        if let Some(log) = r.log.as_mut() {
            log.data.volume_ref.clear();
        }
        assert_eq!(malformed_reason(&r), "log: data `log-1` has no volume ref");

        let mut r = run();
        r.body.plan.image = None;
        assert_eq!(malformed_reason(&r), "no image or no version");
    }

    #[test]
    fn outputs_must_not_share_knit_ids() {
        let mut r = run();
        r.outputs[1].data.knit_id = "out-1".into();
        assert_eq!(
            malformed_reason(&r),
            "knit id `out-1` is assigned more than once"
        );

        let mut r = run();
        if let Some(log) = r.log.as_mut() {
            log.data.knit_id = "out-2".into();
        }
        assert_eq!(
            malformed_reason(&r),
            "knit id `out-2` is assigned more than once"
        );

        let err = Executable::new(&r, BTreeMap::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "malformed run [planId:plan-1 runId:run-1]: knit id `out-2` is assigned more than once"
        );
    }

    #[test]
    fn jobs_run_the_plan_with_its_data() {
        let env = BTreeMap::from_iter([("KNIT_RUN".to_string(), "run-1".to_string())]);
        let executable = Executable::new(&run(), env).unwrap();
        let job = executable.build(&config());

        assert_eq!(job.metadata.name.as_deref(), Some("worker-run-1"));
        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["app.kubernetes.io/component"], "worker");
        assert_eq!(labels["knitfab/id-type"], "runid");
        assert_eq!(labels["knitfab/id"], "run-1");
        assert_eq!(labels["knitfab/run"], "run-1");
        assert_eq!(labels["knitfab/plan"], "plan-1");

        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.parallelism, Some(1));
        assert_eq!(spec.backoff_limit, Some(0));

        let pod = pod_spec(&job);
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.enable_service_links, Some(false));
        assert_eq!(pod.automount_service_account_token, Some(false));
        assert_eq!(pod.priority_class_name.as_deref(), Some("knitfab-worker"));

        let init: Vec<_> = pod
            .init_containers
            .iter()
            .flatten()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(init, ["init-main", "init-log"]);
        let containers: Vec<_> = pod.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(containers, ["main", "nurse"]);

        let init_containers = pod.init_containers.as_deref().unwrap();
        let init_main = container(init_containers, "init-main");
        assert_eq!(init_main.args.as_ref().unwrap(), &["/out/1", "/out/2"]);
        assert_eq!(
            mounts_of(init_main),
            [("out-1", "/out/1", true), ("out-2", "/out/2", true)]
        );

        let init_log = container(init_containers, "init-log");
        assert_eq!(init_log.args.as_ref().unwrap(), &["/log"]);
        assert_eq!(mounts_of(init_log), [("log-1", "/log", true)]);

        let main = container(&pod.containers, "main");
        assert_eq!(main.image.as_deref(), Some("example.com/train:v1"));
        assert_eq!(main.command.as_ref().unwrap(), &["python"]);
        assert_eq!(main.args.as_ref().unwrap(), &["main.py"]);
        assert_eq!(
            mounts_of(main),
            [
                ("in-1", "/in/1", true),
                ("in-2", "/in/2", true),
                ("out-1", "/out/1", false),
                ("out-2", "/out/2", false),
            ]
        );
        let limits = main.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits["cpu"], Quantity("1".into()));
        assert_eq!(limits["memory"], Quantity("1Gi".into()));
        let env = main.env.as_ref().unwrap();
        assert_eq!(env[0].name, "KNIT_RUN");
        assert_eq!(env[0].value.as_deref(), Some("run-1"));

        let nurse = container(&pod.containers, "nurse");
        assert_eq!(nurse.image.as_deref(), Some("knitfab/nurse:v1"));
        assert_eq!(nurse.args.as_ref().unwrap(), &["main", "/log/log"]);
        assert_eq!(
            mounts_of(nurse),
            [
                ("log-1", "/log", false),
                (
                    "serviceaccount",
                    "/var/run/secrets/kubernetes.io/serviceaccount",
                    true
                ),
            ]
        );
        let fields: Vec<_> = nurse
            .env
            .iter()
            .flatten()
            .map(|e| {
                (
                    e.name.as_str(),
                    e.value_from
                        .as_ref()
                        .and_then(|v| v.field_ref.as_ref())
                        .map(|f| f.field_path.as_str())
                        .unwrap_or_default(),
                )
            })
            .collect();
        assert_eq!(
            fields,
            [
                ("POD_NAME", "metadata.name"),
                ("NAMESPACE", "metadata.namespace")
            ]
        );

        let volumes: Vec<_> = pod
            .volumes
            .iter()
            .flatten()
            .map(|v| v.name.as_str())
            .collect();
        assert_eq!(
            volumes,
            ["serviceaccount", "in-1", "in-2", "out-1", "out-2", "log-1"]
        );
        assert_eq!(
            pod.volumes.as_ref().unwrap()[0]
                .secret
                .as_ref()
                .and_then(|s| s.secret_name.as_deref()),
            Some("nurse-token")
        );

        assert!(pod.tolerations.is_none());
        assert!(pod.affinity.is_none());

        // Finding a worker relies on the same metadata being built every time
        assert_eq!(executable.build(&config()).metadata, job.metadata);
    }

    #[test]
    fn runs_without_outputs_or_log_need_no_auxiliary_containers() {
        let mut r = run();
        r.outputs.clear();
        r.log = None;
        r.body.plan.service_account = Some("trainer".into());

        let job = Executable::new(&r, BTreeMap::new())
            .unwrap()
            .build(&config());
        let pod = pod_spec(&job);

        assert!(pod.init_containers.is_none());
        assert_eq!(pod.containers.len(), 1);
        assert_eq!(pod.service_account_name.as_deref(), Some("trainer"));
        assert_eq!(pod.automount_service_account_token, Some(true));
        assert!(container(&pod.containers, "main").env.is_none());
    }

    #[test]
    fn placement_rules_become_tolerations_and_affinity() {
        let rule = |mode, key: &str, value: &str| OnNode {
            mode,
            key: key.into(),
            value: value.into(),
        };

        let mut r = run();
        r.body.plan.on_node = vec![
            rule(OnNodeMode::May, "accelerator", "tpu"),
            rule(OnNodeMode::Prefer, "ram", "large"),
            rule(OnNodeMode::Prefer, "ram", "huge"),
            rule(OnNodeMode::Must, "accelerator", "gpu"),
            rule(OnNodeMode::Must, "accelerator", "tpu"),
            rule(OnNodeMode::Must, "zone", "a"),
        ];

        let job = Executable::new(&r, BTreeMap::new())
            .unwrap()
            .build(&config());
        let pod = pod_spec(&job);

        let tolerations: Vec<_> = pod
            .tolerations
            .iter()
            .flatten()
            .map(|t| {
                (
                    t.key.as_deref().unwrap_or_default(),
                    t.value.as_deref().unwrap_or_default(),
                    t.effect.as_deref().unwrap_or_default(),
                )
            })
            .collect();
        assert_eq!(
            tolerations,
            [
                ("accelerator", "gpu", "NoSchedule"),
                ("accelerator", "gpu", "PreferNoSchedule"),
                ("accelerator", "tpu", "NoSchedule"),
                ("accelerator", "tpu", "PreferNoSchedule"),
                ("ram", "huge", "NoSchedule"),
                ("ram", "huge", "PreferNoSchedule"),
                ("ram", "large", "NoSchedule"),
                ("ram", "large", "PreferNoSchedule"),
                ("zone", "a", "NoSchedule"),
                ("zone", "a", "PreferNoSchedule"),
            ]
        );
        assert!(
            pod.tolerations
                .iter()
                .flatten()
                .all(|t| t.operator.as_deref() == Some("Equal"))
        );

        let node = pod
            .affinity
            .as_ref()
            .and_then(|a| a.node_affinity.as_ref())
            .unwrap();

        let preferred: Vec<_> = node
            .preferred_during_scheduling_ignored_during_execution
            .iter()
            .flatten()
            .map(|t| {
                let e = &t.preference.match_expressions.as_ref().unwrap()[0];
                (t.weight, e.key.as_str(), e.values.clone().unwrap_or_default())
            })
            .collect();
        assert_eq!(
            preferred,
            [
                (1, "ram", vec!["huge".to_string()]),
                (1, "ram", vec!["large".to_string()]),
            ]
        );

        let required = node
            .required_during_scheduling_ignored_during_execution
            .as_ref()
            .unwrap();
        assert_eq!(required.node_selector_terms.len(), 1);
        let expressions: Vec<_> = required.node_selector_terms[0]
            .match_expressions
            .iter()
            .flatten()
            .map(|e| {
                (
                    e.key.as_str(),
                    e.operator.as_str(),
                    e.values.clone().unwrap_or_default(),
                )
            })
            .collect();
        assert_eq!(
            expressions,
            [
                (
                    "accelerator",
                    "In",
                    vec!["gpu".to_string(), "tpu".to_string()]
                ),
                ("zone", "In", vec!["a".to_string()]),
            ]
        );
    }

    #[tokio::test]
    async fn workers_are_spawned_and_found() {
        let client = Arc::new(FakeKubeClient::new());
        let cluster = Cluster::new(client.clone(), "knitfab", "cluster.local");
        let token = CancellationToken::new();
        let r = run();

        let executable = Executable::new(&r, BTreeMap::new()).unwrap();
        let worker = spawn(&cluster, &config(), &token, &executable)
            .await
            .unwrap();
        assert_eq!(worker.run_id(), "run-1");
        assert_eq!(worker.name(), "worker-run-1");
        assert_eq!(worker.job_status().await.state, JobState::Pending);

        client.insert_pod(
            "knitfab",
            KubePod {
                metadata: ObjectMeta {
                    name: Some("worker-run-1-abcde".into()),
                    labels: Some(BTreeMap::from_iter([(
                        "job-name".to_string(),
                        "worker-run-1".to_string(),
                    )])),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        client.set_log("worker-run-1-abcde", "main", ["epoch 1", "epoch 2"]);

        let found = find(&cluster, &token, &r.body).await.unwrap();
        assert_eq!(found.run_id(), "run-1");
        let lines: Vec<_> = found
            .log()
            .await
            .unwrap()
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(lines, ["epoch 1", "epoch 2"]);

        found.close().await.unwrap();
        assert!(client.job("worker-run-1").is_none());

        let err = find(&cluster, &token, &r.body).await.err().unwrap();
        assert!(err.is_missing());
    }
}
