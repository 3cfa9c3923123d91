use bcs_webhook_k8s_api as k8s;
use std::{
    collections::{HashMap, HashSet},
    hash::{BuildHasherDefault, Hasher},
};

/// A `HashSet` specialized for ports.
///
/// Because ports are `u16` values, this type avoids the overhead of actually
/// hashing ports.
pub(crate) type PortSet = HashSet<u16, BuildHasherDefault<PortHasher>>;

/// A `HashMap` specialized for ports.
///
/// Because ports are `u16` values, this type avoids the overhead of actually
/// hashing ports.
pub(crate) type PortMap<V> = HashMap<u16, V, BuildHasherDefault<PortHasher>>;

/// A hasher for ports.
///
/// Because ports are single `u16` values, we don't have to hash them; we can
/// just use the integer values as hashes directly.
#[derive(Debug, Default)]
pub(crate) struct PortHasher(u16);

/// A container port declared in a pod spec, located by its container and port
/// indices.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DeclaredPort<'p> {
    pub container: usize,
    pub index: usize,
    pub port: &'p k8s::ContainerPort,
}

/// Enumerates every port declared by the pod's (non-init) containers, in
/// container order.
pub(crate) fn declared_ports(spec: &k8s::PodSpec) -> impl Iterator<Item = DeclaredPort<'_>> + '_ {
    spec.containers
        .iter()
        .enumerate()
        .flat_map(|(container, c)| {
            c.ports
                .iter()
                .flatten()
                .enumerate()
                .map(move |(index, port)| DeclaredPort {
                    container,
                    index,
                    port,
                })
        })
}

// === impl PortHasher ===

impl Hasher for PortHasher {
    fn write(&mut self, _: &[u8]) {
        unreachable!("hashing a `u16` calls `write_u16`");
    }

    #[inline]
    fn write_u16(&mut self, port: u16) {
        self.0 = port;
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.0 as u64
    }
}
