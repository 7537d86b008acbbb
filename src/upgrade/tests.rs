use std::collections::BTreeMap;
use std::sync::Mutex;

use k8s_openapi::api::core::v1::{
    ConfigMap, NodeAddress, NodeSpec, NodeStatus, PodCondition, PodStatus,
};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};

use super::*;
use crate::store::MockObjectStore;
use crate::target::{ExecOutput, MockTargetCluster};

const UPGRADE_ID: &str = "100";
const REPLACEMENT: &str = "cp-0.upgrade.100";

fn v(s: &str) -> Version {
    parse_tolerant(s).unwrap()
}

fn test_config(kubernetes_version: Option<&str>) -> Config {
    Config {
        kubernetes_version: kubernetes_version.map(str::to_string),
        upgrade_id: Some(UPGRADE_ID.to_string()),
        cluster_namespace: "default".to_string(),
        cluster_name: "prod".to_string(),
        ..Default::default()
    }
}

fn machine(
    name: &str,
    version: Option<&str>,
    provider_id: Option<&str>,
    annotation_value: Option<&str>,
) -> DynamicObject {
    let mut obj = DynamicObject::new(name, &capi::machine_resource());
    obj.metadata.namespace = Some("default".to_string());
    obj.metadata.resource_version = Some("1".to_string());
    if let Some(value) = annotation_value {
        obj.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_UPGRADE_ID.to_string(),
            value.to_string(),
        )]));
    }

    let mut spec = json!({
        "infrastructureRef": {
            "apiVersion": "infrastructure.cluster.x-k8s.io/v1beta1",
            "kind": "VSphereMachine",
            "name": name,
        },
        "bootstrap": {
            "configRef": {
                "apiVersion": capi::BOOTSTRAP_API_VERSION,
                "kind": "KubeadmConfig",
                "name": name,
            },
            "data": "a3ViZWFkbSBqb2lu",
        },
        "failureDomain": "us-west-2a",
    });
    if let Some(version) = version {
        spec["version"] = json!(version);
    }
    if let Some(provider_id) = provider_id {
        spec["providerID"] = json!(provider_id);
    }
    obj.data = json!({ "spec": spec });
    obj
}

fn infra_object(name: &str) -> DynamicObject {
    let ar = capi::resource_for_ref(&capi::ObjectRef {
        api_version: "infrastructure.cluster.x-k8s.io/v1beta1".to_string(),
        kind: "VSphereMachine".to_string(),
        name: name.to_string(),
    });
    let mut obj = DynamicObject::new(name, &ar);
    obj.metadata.namespace = Some("default".to_string());
    obj.metadata.resource_version = Some("3".to_string());
    obj.metadata.owner_references = Some(vec![Default::default()]);
    obj.data = json!({
        "spec": {
            "providerID": "aws:///us-west-2a/i-old",
            "template": "ubuntu-1804-kube-v1.16.3",
            "memoryMiB": 8192,
        },
    });
    obj
}

fn bootstrap_object(name: &str) -> DynamicObject {
    let mut obj = DynamicObject::new(name, &capi::kubeadm_config_resource());
    obj.metadata.namespace = Some("default".to_string());
    obj.metadata.resource_version = Some("4".to_string());
    obj.metadata.owner_references = Some(vec![Default::default()]);
    obj.data = json!({
        "spec": {
            "initConfiguration": {
                "nodeRegistration": {"name": name, "kubeletExtraArgs": {"cloud-provider": "external"}},
            },
        },
    });
    obj
}

fn pki_secret(name: &str) -> DynamicObject {
    let mut obj = DynamicObject::new(name, &capi::secret_resource());
    obj.metadata.namespace = Some("default".to_string());
    obj.metadata.resource_version = Some("5".to_string());
    obj.data = json!({"data": {"tls.crt": "Zm9v"}});
    obj
}

fn node(name: &str, provider_id: &str, hostname: &str) -> Node {
    Node {
        metadata: kube::core::ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            provider_id: Some(provider_id.to_string()),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            addresses: Some(vec![NodeAddress {
                type_: "Hostname".to_string(),
                address: hostname.to_string(),
            }]),
            ..Default::default()
        }),
    }
}

fn pod_with_conditions(conditions: &[&str]) -> Pod {
    Pod {
        status: Some(PodStatus {
            conditions: Some(
                conditions
                    .iter()
                    .map(|c| PodCondition {
                        type_: (*c).to_string(),
                        status: "True".to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn ready_pod() -> Pod {
    pod_with_conditions(&["PodScheduled", "Initialized", "Ready", "ContainersReady"])
}

fn etcd_pod(name: &str, ip: &str) -> Pod {
    Pod {
        metadata: kube::core::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("kube-system".to_string()),
            ..Default::default()
        },
        status: Some(PodStatus {
            pod_ip: Some(ip.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn kubeadm_config_map() -> ConfigMap {
    ConfigMap {
        metadata: kube::core::ObjectMeta {
            name: Some("kubeadm-config".to_string()),
            namespace: Some("kube-system".to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "ClusterConfiguration".to_string(),
            "clusterName: prod\nkubernetesVersion: v1.16.3\n".to_string(),
        )])),
        ..Default::default()
    }
}

const MEMBER_LIST_JSON: &str = r#"{"members": [{"ID": 12345, "name": "host-old", "clientURLs": ["https://10.0.0.1:2379"]}]}"#;

// =========================================================================
// Pure pieces: skip decisions, readiness predicate, replacement builders
// =========================================================================

#[test]
fn machines_with_a_foreign_upgrade_id_are_skipped() {
    let m = machine("cp-0", Some("1.16.3"), Some("aws:///za/i-1"), Some("99"));
    assert_eq!(
        skip_reason(&m, UPGRADE_ID),
        Some(SkipReason::ForeignUpgradeId("99".to_string()))
    );
}

#[test]
fn replacement_machines_are_skipped() {
    let m = machine(
        REPLACEMENT,
        Some("1.16.3"),
        Some("aws:///za/i-2"),
        Some(UPGRADE_ID),
    );
    assert_eq!(skip_reason(&m, UPGRADE_ID), Some(SkipReason::IsReplacement));
}

#[test]
fn annotated_originals_are_processed() {
    let m = machine("cp-0", Some("1.16.3"), Some("aws:///za/i-1"), Some(UPGRADE_ID));
    assert_eq!(skip_reason(&m, UPGRADE_ID), None);

    // A replacement from an earlier run is an ordinary original for this one.
    let old = machine(
        "cp-0.upgrade.99",
        Some("1.16.3"),
        Some("aws:///za/i-1"),
        Some(UPGRADE_ID),
    );
    assert_eq!(skip_reason(&old, UPGRADE_ID), None);
}

#[test]
fn pod_readiness_requires_every_condition() {
    assert!(pod_conditions_met(&ready_pod()));
    assert!(!pod_conditions_met(&pod_with_conditions(&[
        "PodScheduled",
        "Initialized",
        "Ready"
    ])));
    assert!(!pod_conditions_met(&Pod::default()));

    // A condition present but not True does not count.
    let mut pod = ready_pod();
    pod.status.as_mut().unwrap().conditions.as_mut().unwrap()[2].status = "False".to_string();
    assert!(!pod_conditions_met(&pod));
}

#[test]
fn replacement_machine_is_renamed_cleared_and_versioned() {
    let original = machine("cp-0", Some("1.16.3"), Some("aws:///za/i-old"), Some(UPGRADE_ID));
    let replacement = build_replacement_machine(&original, REPLACEMENT, &v("1.17.0"));

    assert_eq!(replacement.metadata.name.as_deref(), Some(REPLACEMENT));
    assert!(replacement.metadata.resource_version.is_none());
    assert!(replacement.data.pointer("/spec/providerID").is_none());
    assert!(replacement.data.pointer("/spec/bootstrap/data").is_none());
    assert_eq!(
        replacement.data.pointer("/spec/version"),
        Some(&json!("1.17.0"))
    );
    assert_eq!(
        replacement.data.pointer("/spec/infrastructureRef/name"),
        Some(&json!(REPLACEMENT))
    );
    assert_eq!(
        replacement.data.pointer("/spec/bootstrap/configRef/name"),
        Some(&json!(REPLACEMENT))
    );
    // Fields the tool does not understand ride along unchanged.
    assert_eq!(
        replacement.data.pointer("/spec/failureDomain"),
        Some(&json!("us-west-2a"))
    );
    // The kind of the referenced objects is untouched.
    assert_eq!(
        replacement.data.pointer("/spec/infrastructureRef/kind"),
        Some(&json!("VSphereMachine"))
    );
}

#[test]
fn replacement_infra_loses_provider_id_and_owners() {
    let original = infra_object("cp-0");
    let replacement = build_replacement_infra(&original, REPLACEMENT, None);

    assert_eq!(replacement.metadata.name.as_deref(), Some(REPLACEMENT));
    assert!(replacement.metadata.resource_version.is_none());
    assert!(replacement.metadata.owner_references.is_none());
    assert!(replacement.data.pointer("/spec/providerID").is_none());
    assert_eq!(
        replacement.data.pointer("/spec/memoryMiB"),
        Some(&json!(8192))
    );
}

#[test]
fn replacement_infra_applies_the_image_override() {
    let original = infra_object("cp-0");
    let replacement = build_replacement_infra(
        &original,
        REPLACEMENT,
        Some(("template", "ubuntu-1804-kube-v1.17.0")),
    );
    assert_eq!(
        replacement.data.pointer("/spec/template"),
        Some(&json!("ubuntu-1804-kube-v1.17.0"))
    );
}

#[test]
fn replacement_bootstrap_always_joins() {
    let original = bootstrap_object("cp-0");
    let replacement = build_replacement_bootstrap(&original, REPLACEMENT);

    assert_eq!(replacement.metadata.name.as_deref(), Some(REPLACEMENT));
    assert!(replacement.metadata.owner_references.is_none());
    assert!(replacement.data.pointer("/spec/initConfiguration").is_none());
    assert_eq!(
        replacement
            .data
            .pointer("/spec/joinConfiguration/nodeRegistration/name"),
        Some(&json!("cp-0"))
    );
}

// =========================================================================
// Orchestrator behavior against mocked clusters
// =========================================================================

#[tokio::test]
async fn upgrade_aborts_before_any_mutation_when_etcd_is_unhealthy() {
    let mut store = MockObjectStore::new();
    store.expect_list().returning(|_, _, _| {
        Ok(vec![
            machine("cp-0", Some("1.16.3"), Some("aws:///za/i-0"), None),
            machine("cp-1", Some("1.16.3"), Some("aws:///za/i-1"), None),
            machine("cp-2", Some("1.16.3"), Some("aws:///za/i-2"), None),
        ])
    });
    // Any create/patch/delete on the store would panic: no expectations.

    let mut target = MockTargetCluster::new();
    target
        .expect_list_pods()
        .returning(|_, _| Ok(vec![etcd_pod("etcd-host-old", "10.0.0.1")]));

    let mut calls = 0;
    target.expect_pod_exec().returning_st(move |_, _, command, _| {
        calls += 1;
        if calls == 1 {
            // member list succeeds, endpoint health does not
            Ok(ExecOutput {
                stdout: MEMBER_LIST_JSON.to_string(),
                success: true,
                ..Default::default()
            })
        } else {
            assert!(command[2].contains("endpoint health"));
            Ok(ExecOutput {
                stderr: "https://10.0.0.1:2379 is unhealthy: failed to commit proposal".to_string(),
                success: false,
                ..Default::default()
            })
        }
    });

    let mut upgrader =
        ControlPlaneUpgrader::new(Arc::new(store), Arc::new(target), &test_config(None)).unwrap();

    let err = upgrader.upgrade().await.unwrap_err();
    assert!(matches!(err, Error::Etcd(_)));
}

#[tokio::test]
async fn upgrade_fails_when_no_control_plane_machines_match() {
    let mut store = MockObjectStore::new();
    store.expect_list().returning(|_, _, _| Ok(vec![]));

    let target = MockTargetCluster::new();
    let mut upgrader =
        ControlPlaneUpgrader::new(Arc::new(store), Arc::new(target), &test_config(None)).unwrap();

    let err = upgrader.upgrade().await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn machines_being_deleted_are_filtered_out() {
    let mut store = MockObjectStore::new();
    store.expect_list().returning(|_, _, _| {
        let mut deleting = machine("cp-0", Some("1.16.3"), Some("aws:///za/i-0"), None);
        deleting.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            ));
        Ok(vec![deleting])
    });

    let target = MockTargetCluster::new();
    let mut upgrader =
        ControlPlaneUpgrader::new(Arc::new(store), Arc::new(target), &test_config(None)).unwrap();

    // The only machine is terminating, so the list is effectively empty.
    let err = upgrader.upgrade().await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn nil_machine_version_fails_version_resolution() {
    let mut store = MockObjectStore::new();
    store
        .expect_list()
        .returning(|_, _, _| Ok(vec![machine("cp-0", None, Some("aws:///za/i-0"), None)]));

    let target = MockTargetCluster::new();
    let mut upgrader =
        ControlPlaneUpgrader::new(Arc::new(store), Arc::new(target), &test_config(None)).unwrap();

    let err = upgrader.upgrade().await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(err.to_string().contains("cp-0"));
}

#[tokio::test]
async fn foreign_and_replacement_machines_are_not_replaced() {
    // Scenario: cp-0 belongs to run 99, cp-0.upgrade.100 is this run's own
    // replacement. Neither may be touched; no store call is expected at all.
    let store = MockObjectStore::new();
    let target = MockTargetCluster::new();
    let mut upgrader =
        ControlPlaneUpgrader::new(Arc::new(store), Arc::new(target), &test_config(None)).unwrap();

    let machines = vec![
        machine("cp-0", Some("1.16.3"), Some("aws:///za/i-0"), Some("99")),
        machine(
            REPLACEMENT,
            Some("1.16.3"),
            Some("aws:///za/i-9"),
            Some(UPGRADE_ID),
        ),
    ];

    let processed = upgrader
        .replace_machines(&machines, &v("1.16.3"))
        .await
        .unwrap();
    // The foreign machine is left entirely alone; this run's own replacement
    // is not replaced again but is still finalized (annotation cleared) at
    // the end of the run.
    assert_eq!(processed, vec![REPLACEMENT.to_string()]);
}

#[tokio::test]
async fn machines_without_a_provider_id_are_logged_and_skipped() {
    let store = MockObjectStore::new();
    let target = MockTargetCluster::new();
    let mut upgrader =
        ControlPlaneUpgrader::new(Arc::new(store), Arc::new(target), &test_config(None)).unwrap();

    let machines = vec![machine("cp-0", Some("1.16.3"), None, None)];
    let processed = upgrader
        .replace_machines(&machines, &v("1.16.3"))
        .await
        .unwrap();
    assert!(processed.is_empty());
}

#[tokio::test]
async fn unannotated_machines_are_stamped_with_the_upgrade_id() {
    let mut store = MockObjectStore::new();
    store
        .expect_patch()
        .withf(|ar, ns, name, body| {
            ar.kind == "Machine"
                && ns == "default"
                && name == "cp-0"
                && body.pointer("/metadata/annotations/upgrade.cluster-api.vmware.com~1id")
                    == Some(&json!(UPGRADE_ID))
                && body.pointer("/metadata/resourceVersion") == Some(&json!("1"))
        })
        .times(1)
        .returning(|_, _, name, _| Ok(DynamicObject::new(name, &capi::machine_resource())));

    let target = MockTargetCluster::new();
    let upgrader =
        ControlPlaneUpgrader::new(Arc::new(store), Arc::new(target), &test_config(None)).unwrap();

    let original = machine("cp-0", Some("1.16.3"), Some("aws:///za/i-0"), None);
    let updated = upgrader
        .ensure_upgrade_annotation(&original)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        capi::annotation(&updated, ANNOTATION_UPGRADE_ID),
        Some(UPGRADE_ID)
    );
}

#[tokio::test]
async fn annotation_patch_failure_skips_the_machine() {
    let mut store = MockObjectStore::new();
    store.expect_patch().returning(|_, _, _, _| {
        Err(Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "conflict".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        })))
    });

    let target = MockTargetCluster::new();
    let upgrader =
        ControlPlaneUpgrader::new(Arc::new(store), Arc::new(target), &test_config(None)).unwrap();

    let original = machine("cp-0", Some("1.16.3"), Some("aws:///za/i-0"), None);
    assert!(upgrader
        .ensure_upgrade_annotation(&original)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn resume_skips_replacement_objects_that_already_exist() {
    // Scenario: a previous run with the same upgrade id crashed after
    // creating the replacement objects. The existence probes answer for
    // all three; no get or create may happen.
    let mut store = MockObjectStore::new();
    store.expect_exists().returning(|_, _, name| {
        assert_eq!(name, REPLACEMENT);
        Ok(true)
    });

    let target = MockTargetCluster::new();
    let mut upgrader =
        ControlPlaneUpgrader::new(Arc::new(store), Arc::new(target), &test_config(None)).unwrap();

    let original = machine("cp-0", Some("1.16.3"), Some("aws:///za/i-0"), Some(UPGRADE_ID));
    upgrader
        .ensure_replacement_infra(REPLACEMENT, &original)
        .await
        .unwrap();
    upgrader
        .ensure_replacement_bootstrap(REPLACEMENT, &original)
        .await
        .unwrap();
    upgrader
        .ensure_replacement_machine(REPLACEMENT, &original, &v("1.17.0"))
        .await
        .unwrap();

    // The bootstrap was not created by this run, so the PKI secrets were
    // left alone and the latch is still unset.
    assert!(!upgrader.secrets_updated);
}

#[tokio::test]
async fn minor_bump_synthesizes_kubelet_scaffolding_before_touching_machines() {
    let mut store = MockObjectStore::new();
    store
        .expect_list()
        .returning(|_, _, _| Ok(vec![machine("cp-0", Some("1.16.3"), Some("aws:///za/i-0"), None)]));

    let events = Arc::new(Mutex::new(Vec::<String>::new()));

    let mut target = MockTargetCluster::new();
    target
        .expect_get_config_map()
        .withf(|_, name| name == "kubelet-config-1.17")
        .returning(|_, _| Ok(None));
    target
        .expect_get_config_map()
        .withf(|_, name| name == "kubelet-config-1.16")
        .returning(|_, _| Ok(Some(ConfigMap::default())));
    {
        let events = events.clone();
        target.expect_create_config_map().returning(move |_, cm| {
            events
                .lock()
                .unwrap()
                .push(format!("create-{}", cm.metadata.name.as_deref().unwrap()));
            Ok(())
        });
    }
    target.expect_get_role().returning(|_, _| Ok(None));
    target.expect_get_role_binding().returning(|_, _| Ok(None));
    {
        let events = events.clone();
        target.expect_create_role().returning(move |_, role: &Role| {
            events
                .lock()
                .unwrap()
                .push(format!("create-role-{}", role.metadata.name.as_deref().unwrap()));
            Ok(())
        });
    }
    {
        let events = events.clone();
        target
            .expect_create_role_binding()
            .returning(move |_, binding: &RoleBinding| {
                events.lock().unwrap().push(format!(
                    "create-binding-{}",
                    binding.metadata.name.as_deref().unwrap()
                ));
                Ok(())
            });
    }
    // The etcd health check then fails, aborting the run before machines.
    target.expect_list_pods().returning(|_, _| Ok(vec![]));

    let mut upgrader = ControlPlaneUpgrader::new(
        Arc::new(store),
        Arc::new(target),
        &test_config(Some("1.17.0")),
    )
    .unwrap();

    let err = upgrader.upgrade().await.unwrap_err();
    assert!(matches!(err, Error::Etcd(_)));

    let events = events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "create-kubelet-config-1.17",
            "create-role-kubeadm:kubelet-config-1.17",
            "create-binding-kubeadm:kubelet-config-1.17",
        ]
    );
}

#[tokio::test]
async fn single_machine_rolling_replacement_happy_path() {
    let events = Arc::new(Mutex::new(Vec::<String>::new()));

    // ----- management cluster -----
    let mut store = MockObjectStore::new();
    store.expect_list().returning(|_, _, _| {
        Ok(vec![machine(
            "cp-0",
            Some("1.16.3"),
            Some("aws:///us-west-2a/i-old"),
            None,
        )])
    });
    store.expect_exists().returning(|_, _, name| {
        assert_eq!(name, REPLACEMENT);
        Ok(false)
    });
    store.expect_get().returning(|ar, _, name| {
        match (ar.kind.as_str(), name) {
            ("VSphereMachine", "cp-0") => Ok(infra_object("cp-0")),
            ("KubeadmConfig", "cp-0") => Ok(bootstrap_object("cp-0")),
            ("Secret", _) => Ok(pki_secret(name)),
            // The replacement machine, once polled, has its provider id.
            ("Machine", REPLACEMENT) => {
                let mut m = machine(
                    REPLACEMENT,
                    Some("1.16.3"),
                    Some("aws:///us-west-2a/i-new"),
                    Some(UPGRADE_ID),
                );
                m.metadata.resource_version = Some("9".to_string());
                Ok(m)
            }
            other => panic!("unexpected get: {:?}", other),
        }
    });
    {
        let events = events.clone();
        store.expect_create().returning(move |ar, _, obj| {
            let mut created = obj.clone();
            match ar.kind.as_str() {
                "VSphereMachine" => {
                    assert_eq!(obj.metadata.name.as_deref(), Some(REPLACEMENT));
                    assert!(obj.data.pointer("/spec/providerID").is_none());
                    events.lock().unwrap().push("create-infra".to_string());
                }
                "KubeadmConfig" => {
                    assert!(obj.data.pointer("/spec/initConfiguration").is_none());
                    assert!(obj.data.pointer("/spec/joinConfiguration").is_some());
                    created.metadata.uid = Some("boot-uid".to_string());
                    events.lock().unwrap().push("create-bootstrap".to_string());
                }
                "Machine" => {
                    assert_eq!(obj.metadata.name.as_deref(), Some(REPLACEMENT));
                    // Desired version defaults to the observed max.
                    assert_eq!(obj.data.pointer("/spec/version"), Some(&json!("1.16.3")));
                    assert!(obj.data.pointer("/spec/providerID").is_none());
                    assert!(obj.data.pointer("/spec/bootstrap/data").is_none());
                    assert_eq!(
                        obj.data.pointer("/spec/infrastructureRef/name"),
                        Some(&json!(REPLACEMENT))
                    );
                    events.lock().unwrap().push("create-machine".to_string());
                }
                other => panic!("unexpected create kind: {}", other),
            }
            Ok(created)
        });
    }
    {
        let events = events.clone();
        store.expect_patch().returning(move |ar, _, name, body| {
            match (ar.kind.as_str(), name) {
                ("Machine", "cp-0") => {
                    assert_eq!(
                        body.pointer("/metadata/annotations/upgrade.cluster-api.vmware.com~1id"),
                        Some(&json!(UPGRADE_ID))
                    );
                    events.lock().unwrap().push("annotate-cp-0".to_string());
                }
                ("Machine", REPLACEMENT) => {
                    assert_eq!(
                        body.pointer("/metadata/annotations/upgrade.cluster-api.vmware.com~1id"),
                        Some(&json!(null))
                    );
                    events.lock().unwrap().push("clear-annotation".to_string());
                }
                ("Secret", _) => {
                    assert_eq!(
                        body.pointer("/metadata/ownerReferences/0/name"),
                        Some(&json!(REPLACEMENT))
                    );
                    assert_eq!(
                        body.pointer("/metadata/ownerReferences/0/uid"),
                        Some(&json!("boot-uid"))
                    );
                    events.lock().unwrap().push(format!("reparent-{}", name));
                }
                other => panic!("unexpected patch: {:?}", other),
            }
            Ok(DynamicObject::new(name, &capi::machine_resource()))
        });
    }
    {
        let events = events.clone();
        store.expect_delete().returning(move |ar, _, name| {
            assert_eq!(ar.kind, "Machine");
            assert_eq!(name, "cp-0");
            events.lock().unwrap().push("delete-cp-0".to_string());
            Ok(())
        });
    }

    // ----- target cluster -----
    let mut target = MockTargetCluster::new();
    target
        .expect_list_pods()
        .returning(|_, selector| {
            assert_eq!(selector, "component=etcd");
            Ok(vec![etcd_pod("etcd-host-old", "10.0.0.1")])
        });
    {
        let events = events.clone();
        target.expect_pod_exec().returning(move |_, _, command, _| {
            let shell = &command[2];
            if shell.contains("member list") {
                Ok(ExecOutput {
                    stdout: MEMBER_LIST_JSON.to_string(),
                    success: true,
                    ..Default::default()
                })
            } else if shell.contains("endpoint health") {
                events.lock().unwrap().push("health-check".to_string());
                Ok(ExecOutput {
                    success: true,
                    ..Default::default()
                })
            } else if shell.contains("member remove") {
                assert!(shell.ends_with("member remove 3039"));
                events.lock().unwrap().push("remove-member".to_string());
                Ok(ExecOutput {
                    success: true,
                    ..Default::default()
                })
            } else {
                panic!("unexpected etcdctl invocation: {}", shell);
            }
        });
    }
    target
        .expect_get_config_map()
        .withf(|_, name| name == "kubeadm-config")
        .returning(|_, _| Ok(Some(kubeadm_config_map())));
    {
        let events = events.clone();
        target.expect_update_config_map().returning(move |_, cm| {
            let config = &cm.data.as_ref().unwrap()["ClusterConfiguration"];
            assert!(config.contains("kubernetesVersion: v1.16.3"));
            assert!(config.contains("clusterName: prod"));
            events.lock().unwrap().push("kubeadm-updated".to_string());
            Ok(())
        });
    }
    target.expect_list_nodes().returning(|| {
        Ok(vec![
            node("old-node", "aws:///us-west-2a/i-old", "host-old"),
            node("new-node", "aws:///us-west-2a/i-new", "host-new"),
        ])
    });
    target.expect_get_pod().returning(|_, name| {
        assert!(name.ends_with("-host-new"), "readiness probed {}", name);
        Ok(Some(ready_pod()))
    });

    let mut upgrader =
        ControlPlaneUpgrader::new(Arc::new(store), Arc::new(target), &test_config(None)).unwrap();

    upgrader.upgrade().await.unwrap();

    let events = events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "health-check",
            "kubeadm-updated",
            "annotate-cp-0",
            "create-infra",
            "create-bootstrap",
            "reparent-prod-ca",
            "reparent-prod-etcd",
            "reparent-prod-sa",
            "reparent-prod-proxy",
            "create-machine",
            "remove-member",
            "delete-cp-0",
            "clear-annotation",
        ]
    );
    assert!(upgrader.secrets_updated);
}
