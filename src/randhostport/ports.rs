use super::InjectError;
use crate::pod::{self, DeclaredPort};
use ahash::AHashSet;
use bcs_webhook_k8s_api::{self as k8s, randhostport::PORTS_ANNOTATION};

/// A container port selected for host port injection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PortRef {
    /// Index into `spec.containers`.
    pub container: usize,

    /// Index into the container's `ports`.
    pub index: usize,

    pub container_port: i32,
}

/// Reads the requested port identifiers from the pod's ports annotation.
///
/// Identifiers keep their annotation order; blank and repeated entries are
/// dropped.
pub(crate) fn requested(annotations: Option<&k8s::Labels>) -> Vec<String> {
    let spec = match annotations.and_then(|a| a.get(PORTS_ANNOTATION)) {
        Some(spec) => spec,
        None => return Vec::new(),
    };

    let mut seen = AHashSet::new();
    spec.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty() && seen.insert(*id))
        .map(String::from)
        .collect()
}

/// Resolves each requested identifier against the pod's declared container
/// ports.
///
/// An identifier matches ports by name first; only when no port has that name
/// is it parsed as a number and matched against `containerPort`. Every
/// identifier must resolve to exactly one port, and no port may be selected
/// by two identifiers; otherwise nothing is selected.
pub(crate) fn select(spec: &k8s::PodSpec, requested: &[String]) -> Result<Vec<PortRef>, InjectError> {
    if requested.is_empty() {
        return Err(InjectError::NoPortsRequested);
    }
    if pod::declared_ports(spec).next().is_none() {
        return Err(InjectError::NoPortsDeclared);
    }

    let mut selected = Vec::with_capacity(requested.len());
    for id in requested {
        let by_name = pod::declared_ports(spec)
            .filter(|p| p.port.name.as_deref() == Some(id.as_str()))
            .map(PortRef::from)
            .collect::<Vec<_>>();
        if !by_name.is_empty() {
            selected.extend(by_name);
            continue;
        }

        if let Ok(number) = id.parse::<i32>() {
            selected.extend(
                pod::declared_ports(spec)
                    .filter(|p| p.port.container_port == number)
                    .map(PortRef::from),
            );
        }
    }

    let mut seen = AHashSet::with_capacity(selected.len());
    selected.retain(|p| seen.insert((p.container, p.index)));
    if selected.len() != requested.len() {
        return Err(InjectError::PortsMismatch {
            requested: requested.join(","),
            matched: selected.len(),
        });
    }
    Ok(selected)
}

impl From<DeclaredPort<'_>> for PortRef {
    fn from(declared: DeclaredPort<'_>) -> Self {
        Self {
            container: declared.container,
            index: declared.index,
            container_port: declared.port.container_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(ports: &str) -> k8s::Labels {
        Some((PORTS_ANNOTATION.to_string(), ports.to_string()))
            .into_iter()
            .collect()
    }

    fn port(name: Option<&str>, container_port: i32) -> k8s::ContainerPort {
        k8s::ContainerPort {
            name: name.map(String::from),
            container_port,
            ..Default::default()
        }
    }

    fn spec(containers: Vec<Vec<k8s::ContainerPort>>) -> k8s::PodSpec {
        k8s::PodSpec {
            containers: containers
                .into_iter()
                .enumerate()
                .map(|(i, ports)| k8s::Container {
                    name: format!("c{i}"),
                    ports: Some(ports),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn requested_keeps_order_and_drops_blanks_and_duplicates() {
        assert_eq!(
            requested(Some(&annotations(" http , 8080,,http, 9090 "))),
            vec!["http", "8080", "9090"]
        );
        assert!(requested(Some(&annotations(" , "))).is_empty());
        assert!(requested(Some(&k8s::Labels::new())).is_empty());
        assert!(requested(None).is_empty());
    }

    #[test]
    fn selects_by_name_and_number_in_request_order() {
        let spec = spec(vec![vec![port(None, 8080)], vec![port(Some("http"), 8081)]]);
        let selected = select(&spec, &["http".to_string(), "8080".to_string()]).unwrap();
        assert_eq!(
            selected,
            vec![
                PortRef {
                    container: 1,
                    index: 0,
                    container_port: 8081
                },
                PortRef {
                    container: 0,
                    index: 0,
                    container_port: 8080
                },
            ]
        );
    }

    #[test]
    fn name_match_takes_precedence_over_number() {
        let spec = spec(vec![vec![port(None, 8080), port(Some("8080"), 9000)]]);
        let selected = select(&spec, &["8080".to_string()]).unwrap();
        assert_eq!(
            selected,
            vec![PortRef {
                container: 0,
                index: 1,
                container_port: 9000
            }]
        );
    }

    #[test]
    fn unmatched_identifier_fails() {
        let spec = spec(vec![vec![port(Some("http"), 8080)]]);
        let error = select(&spec, &["http".to_string(), "grpc".to_string()]).unwrap_err();
        assert!(
            matches!(error, InjectError::PortsMismatch { matched: 1, .. }),
            "{error}"
        );
    }

    #[test]
    fn ambiguous_identifier_fails() {
        let spec = spec(vec![vec![port(None, 8080)], vec![port(None, 8080)]]);
        let error = select(&spec, &["8080".to_string()]).unwrap_err();
        assert!(
            matches!(error, InjectError::PortsMismatch { matched: 2, .. }),
            "{error}"
        );
    }

    #[test]
    fn port_selected_twice_fails() {
        let spec = spec(vec![vec![port(Some("http"), 8081), port(None, 8080)]]);
        let error = select(&spec, &["http".to_string(), "8081".to_string()]).unwrap_err();
        assert!(
            matches!(error, InjectError::PortsMismatch { matched: 1, .. }),
            "{error}"
        );
    }

    #[test]
    fn no_ports_requested_or_declared() {
        let declared = spec(vec![vec![port(None, 8080)]]);
        assert!(matches!(
            select(&declared, &[]),
            Err(InjectError::NoPortsRequested)
        ));

        let undeclared = spec(vec![vec![]]);
        assert!(matches!(
            select(&undeclared, &["8080".to_string()]),
            Err(InjectError::NoPortsDeclared)
        ));
    }
}
