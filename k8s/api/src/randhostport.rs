//! Annotations, labels and environment variables understood and produced by
//! the random hostport injector.

/// Pods must carry this annotation, set to [`INJECT_ANNOTATION_VALUE`], to
/// have host ports injected.
pub const INJECT_ANNOTATION: &str = "randhostport.webhook.bkbcs.tencent.com";
pub const INJECT_ANNOTATION_VALUE: &str = "true";

/// Comma-separated list of container port names or numbers to allocate host
/// ports for.
pub const PORTS_ANNOTATION: &str = "ports.randhostport.webhook.bkbcs.tencent.com";

/// When present, each selected container port is rewritten to equal its
/// allocated host port.
pub const CONTAINER_PORT_ANNOTATION: &str =
    "randcontainerport.randhostport.webhook.bkbcs.tencent.com";

/// Marks a pod whose host ports were injected.
pub const INJECTED_LABEL: &str = "randhostport.webhook.bkbcs.tencent.com";
pub const INJECTED_LABEL_VALUE: &str = "true";

/// Suffix of the per-port label, `<hostPort>.<suffix>=<hostPort>`.
pub const HOSTPORT_LABEL_SUFFIX: &str = "randhostport.webhook.bkbcs.tencent.com";

/// Prefix of the per-allocation annotation, `<prefix>.<port>=<hostPort>`.
pub const HOSTPORT_ANNOTATION_PREFIX: &str = "randhostport.webhook.bkbcs.tencent.com";

pub const ENV_CONTAINER_PORT_PREFIX: &str = "BCS_RANDHOSTPORT_FOR_CONTAINER_PORT_";
pub const ENV_HOST_IP: &str = "BCS_RANDHOSTPORT_HOSTIP";
pub const ENV_POD_NAME: &str = "BCS_RANDHOSTPORT_POD_NAME";
pub const ENV_POD_NAMESPACE: &str = "BCS_RANDHOSTPORT_POD_NAMESPACE";

/// Returns the label selector matching every injected pod.
pub fn injected_selector() -> String {
    format!("{}={}", INJECTED_LABEL, INJECTED_LABEL_VALUE)
}

/// Returns the key of the label recording that a pod holds `port`.
pub fn hostport_label(port: u16) -> String {
    format!("{}.{}", port, HOSTPORT_LABEL_SUFFIX)
}

/// Returns the key of the annotation recording the host port allocated for
/// `port`.
pub fn hostport_annotation(port: i32) -> String {
    format!("{}.{}", HOSTPORT_ANNOTATION_PREFIX, port)
}

/// Returns the name of the environment variable that exposes the host port
/// allocated for `container_port`.
pub fn container_port_env(container_port: i32) -> String {
    format!("{}{}", ENV_CONTAINER_PORT_PREFIX, container_port)
}

/// Reads the host port held by a pod from one of its labels.
///
/// Any label whose key ends with `.<suffix>` and whose value is a non-zero
/// port number names a host port.
pub fn parse_hostport_label(key: &str, value: &str) -> Option<u16> {
    let prefix = key.strip_suffix(HOSTPORT_LABEL_SUFFIX)?;
    if !prefix.ends_with('.') {
        return None;
    }
    match value.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}
