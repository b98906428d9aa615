//! Shape k8s-openapi objects into core snapshots.

use chrono::{DateTime, Utc};
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use korral_core::{DeploymentSnapshot, LabelSelector, PodPhase, PodSnapshot, SelectorOp, SelectorRequirement};
use tracing::warn;

pub fn pod_snapshot(pod: &Pod) -> Option<PodSnapshot> {
    let name = pod.metadata.name.clone()?;
    let status = pod.status.as_ref();
    Some(PodSnapshot {
        name,
        phase: PodPhase::from_api(status.and_then(|s| s.phase.as_deref())),
        ip: status.and_then(|s| s.pod_ip.clone()),
        labels: pod.metadata.labels.clone().unwrap_or_default(),
    })
}

pub fn label_selector(sel: &metav1::LabelSelector) -> LabelSelector {
    let mut out = LabelSelector {
        match_labels: sel.match_labels.clone().unwrap_or_default(),
        match_expressions: Vec::new(),
    };
    for req in sel.match_expressions.iter().flatten() {
        match SelectorOp::from_api(&req.operator) {
            Some(operator) => out.match_expressions.push(SelectorRequirement {
                key: req.key.clone(),
                operator,
                values: req.values.clone().unwrap_or_default(),
            }),
            None => warn!(key = %req.key, op = %req.operator, "skipping selector requirement with unknown operator"),
        }
    }
    out
}

/// `now` is passed in so age is computed against one clock per listing.
pub fn deployment_snapshot(dep: &Deployment, now: DateTime<Utc>) -> Option<DeploymentSnapshot> {
    let name = dep.metadata.name.clone()?;
    let spec = dep.spec.as_ref();
    let status = dep.status.as_ref();

    // The API server defaults an omitted spec.replicas to 1.
    let desired = spec.and_then(|s| s.replicas).unwrap_or(1);
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
    let available = status.and_then(|s| s.available_replicas).unwrap_or(0);
    let updated = status.and_then(|s| s.updated_replicas).unwrap_or(0);

    let images = spec
        .and_then(|s| s.template.spec.as_ref())
        .map(|ps| ps.containers.iter().filter_map(|c| c.image.clone()).collect())
        .unwrap_or_default();

    let age_seconds = dep
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|ts| {
            let ms = (now - ts.0).num_milliseconds().max(0);
            (ms as f64 / 100.0).round() / 10.0
        })
        .unwrap_or(0.0);

    Some(DeploymentSnapshot {
        name,
        ready_replicas: ready,
        desired_replicas: desired,
        available_replicas: available,
        updated_replicas: updated,
        images,
        age_seconds,
        healthy: DeploymentSnapshot::is_healthy(ready, desired, available),
        selector: spec.map(|s| label_selector(&s.selector)).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus, PodTemplateSpec};
    use std::collections::BTreeMap;

    fn deployment(replicas: Option<i32>, status: Option<DeploymentStatus>) -> Deployment {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("valid date");
        Deployment {
            metadata: metav1::ObjectMeta {
                name: Some("checkout".into()),
                namespace: Some("default".into()),
                creation_timestamp: Some(metav1::Time(created)),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas,
                selector: metav1::LabelSelector {
                    match_labels: Some(BTreeMap::from([("app".to_string(), "checkout".to_string())])),
                    match_expressions: Some(vec![metav1::LabelSelectorRequirement {
                        key: "track".into(),
                        operator: "NotIn".into(),
                        values: Some(vec!["canary".into()]),
                    }]),
                },
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers: vec![
                            Container { name: "app".into(), image: Some("shop/checkout:1.4".into()), ..Default::default() },
                            Container { name: "proxy".into(), image: Some("envoy:1.29".into()), ..Default::default() },
                        ],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status,
        }
    }

    #[test]
    fn healthy_deployment_snapshot() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 2, 30).single().expect("valid date");
        let status = DeploymentStatus {
            ready_replicas: Some(3),
            available_replicas: Some(3),
            updated_replicas: Some(3),
            ..Default::default()
        };
        let snap = deployment_snapshot(&deployment(Some(3), Some(status)), now).expect("named");
        assert_eq!(snap.name, "checkout");
        assert_eq!(snap.desired_replicas, 3);
        assert!(snap.healthy);
        assert_eq!(snap.images, vec!["shop/checkout:1.4", "envoy:1.29"]);
        assert_eq!(snap.age_seconds, 150.0);
        assert_eq!(snap.selector.render(), "app=checkout,track notin (canary)");
    }

    #[test]
    fn missing_status_counts_as_zero_and_unhealthy() {
        let now = Utc::now();
        let snap = deployment_snapshot(&deployment(Some(2), None), now).expect("named");
        assert_eq!(snap.ready_replicas, 0);
        assert_eq!(snap.available_replicas, 0);
        assert!(!snap.healthy);
    }

    #[test]
    fn omitted_replicas_default_to_one() {
        let snap = deployment_snapshot(&deployment(None, None), Utc::now()).expect("named");
        assert_eq!(snap.desired_replicas, 1);
    }

    #[test]
    fn zero_replica_deployment_is_healthy() {
        let snap = deployment_snapshot(&deployment(Some(0), None), Utc::now()).expect("named");
        assert!(snap.healthy);
    }

    #[test]
    fn pod_snapshot_reads_phase_ip_and_labels() {
        let pod = Pod {
            metadata: metav1::ObjectMeta {
                name: Some("checkout-abc".into()),
                labels: Some(BTreeMap::from([("app".to_string(), "checkout".to_string())])),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus { phase: Some("Running".into()), pod_ip: Some("10.0.0.7".into()), ..Default::default() }),
        };
        let snap = pod_snapshot(&pod).expect("named");
        assert_eq!(snap.phase, PodPhase::Running);
        assert_eq!(snap.ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(snap.labels.get("app").map(String::as_str), Some("checkout"));

        let unnamed = Pod::default();
        assert!(pod_snapshot(&unnamed).is_none());
    }

    #[test]
    fn unknown_selector_operator_is_dropped() {
        let sel = metav1::LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![metav1::LabelSelectorRequirement {
                key: "x".into(),
                operator: "Gt".into(),
                values: None,
            }]),
        };
        assert!(label_selector(&sel).is_empty());
    }
}
