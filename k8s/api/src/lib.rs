#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod randhostport;

pub use k8s_openapi::{
    api::core::v1::{
        Affinity, Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, Pod,
        PodAffinityTerm, PodAntiAffinity, PodSpec,
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement, ObjectMeta},
};
pub use kube::ResourceExt;

/// Labels or annotations, as they appear on an object's metadata.
pub type Labels = std::collections::BTreeMap<String, String>;

/// The well-known node label used as the topology key for per-node spreading.
pub const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";
