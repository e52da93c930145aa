//! Built-in set of kinds the agent forwards.

use crate::ResourceSchema;

/// `(group, version, resource, kind)`
const DEFAULT_KINDS: &[(&str, &str, &str, &str)] = &[
    ("", "v1", "namespaces", "Namespace"),
    ("", "v1", "nodes", "Node"),
    ("", "v1", "persistentvolumeclaims", "PersistentVolumeClaim"),
    ("apps", "v1", "deployments", "Deployment"),
    ("storage.k8s.io", "v1", "storageclasses", "StorageClass"),
    ("wgpolicyk8s.io", "v1alpha2", "policyreports", "PolicyReport"),
    ("argoproj.io", "v1alpha1", "applications", "Application"),
    ("argoproj.io", "v1alpha1", "appprojects", "AppProject"),
    ("cert-manager.io", "v1", "certificates", "Certificate"),
    ("", "v1", "services", "Service"),
    ("", "v1", "pods", "Pod"),
    ("apps", "v1", "replicasets", "ReplicaSet"),
    ("apps", "v1", "statefulsets", "StatefulSet"),
    ("apps", "v1", "daemonsets", "DaemonSet"),
    ("networking.k8s.io", "v1", "ingresses", "Ingress"),
    ("networking.k8s.io", "v1", "ingressclasses", "IngressClass"),
    ("aquasecurity.github.io", "v1alpha1", "vulnerabilityreports", "VulnerabilityReport"),
    ("aquasecurity.github.io", "v1alpha1", "exposedsecretreports", "ExposedSecretReport"),
    ("aquasecurity.github.io", "v1alpha1", "configauditreports", "ConfigAuditReport"),
    ("aquasecurity.github.io", "v1alpha1", "rbacassessmentreports", "RbacAssessmentReport"),
    ("aquasecurity.github.io", "v1alpha1", "clustercompliancereports", "ClusterComplianceReport"),
    ("", "v1", "endpoints", "Endpoints"),
    ("networking.k8s.io", "v1", "networkpolicies", "NetworkPolicy"),
];

/// Schemas watched when no explicit list is configured.
pub fn default_schemas() -> Vec<ResourceSchema> {
    DEFAULT_KINDS.iter().map(|(g, v, r, _)| ResourceSchema::new(g, v, r)).collect()
}

/// True if `(apiVersion, kind)` has a typed payload shape in the inventory.
pub fn is_known_kind(api_version: &str, kind: &str) -> bool {
    DEFAULT_KINDS.iter().any(|(g, v, _, k)| {
        *k == kind
            && if g.is_empty() {
                api_version == *v
            } else {
                api_version.strip_prefix(g).and_then(|rest| rest.strip_prefix('/')) == Some(*v)
            }
    })
}
