use super::*;
use kube::core::admission::AdmissionReview;
use serde_json::json;

fn config(start_port: u16, end_port: u16) -> Config {
    Config {
        start_port,
        end_port,
        enable_order_assign: false,
        kubeconfig: String::new(),
    }
}

fn game_pod(annotations: serde_json::Value) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": "game",
            "annotations": annotations,
        },
        "spec": {
            "containers": [{
                "name": "server",
                "ports": [
                    { "name": "http", "containerPort": 8081 },
                    { "containerPort": 8080 },
                ],
            }],
        },
    })
}

fn injectable(ports: &str) -> serde_json::Value {
    game_pod(json!({
        (keys::INJECT_ANNOTATION): keys::INJECT_ANNOTATION_VALUE,
        (keys::PORTS_ANNOTATION): ports,
    }))
}

fn request(kind: &str, operation: &str, object: serde_json::Value) -> AdmissionRequest<DynamicObject> {
    let review = serde_json::from_value::<AdmissionReview<DynamicObject>>(json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "0c9a8d74-9cb7-44dd-b98e-09fd62def2f4",
            "kind": { "group": "", "version": "v1", "kind": kind },
            "resource": { "group": "", "version": "v1", "resource": "pods" },
            "requestKind": { "group": "", "version": "v1", "kind": kind },
            "requestResource": { "group": "", "version": "v1", "resource": "pods" },
            "name": "game",
            "namespace": "default",
            "operation": operation,
            "userInfo": { "username": "admin", "groups": ["system:authenticated"] },
            "object": object,
            "oldObject": null,
            "dryRun": false,
        },
    }))
    .unwrap();
    review.try_into().unwrap()
}

/// Applies the response's patch to the pod, as the API server would.
fn patched(pod: serde_json::Value, rsp: &AdmissionResponse) -> k8s::Pod {
    let patch = rsp.patch.as_ref().expect("response must carry a patch");
    let patch = serde_json::from_slice::<json_patch::Patch>(patch).unwrap();
    let mut doc = pod;
    json_patch::patch(&mut doc, &patch).unwrap();
    serde_json::from_value(doc).unwrap()
}

fn message(rsp: &AdmissionResponse) -> &str {
    rsp.result.message.as_deref().unwrap_or_default()
}

fn host_ports(pod: &k8s::Pod) -> Vec<Option<i32>> {
    pod.spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|c| c.ports.iter().flatten())
        .map(|p| p.host_port)
        .collect()
}

#[test]
fn allocates_least_used_ports() {
    let injector = HostPortInjector::new(&config(31000, 31002));
    let cache = injector.cache().expect("ports must be tracked");
    cache.set_quantity(31000, 2).unwrap();

    let pod = injectable("http,8080");
    let rsp = injector.handle(&request("Pod", "CREATE", pod.clone()));
    assert!(rsp.allowed, "{}", message(&rsp));

    let pod = patched(pod, &rsp);
    let mut ports = host_ports(&pod);
    ports.sort_unstable();
    assert_eq!(ports, vec![Some(31001), Some(31002)]);
    assert_eq!(cache.get(31000).unwrap().quantity, 2);
    assert_eq!(cache.get(31001).unwrap().quantity, 1);
    assert_eq!(cache.get(31002).unwrap().quantity, 1);

    let labels = pod.metadata.labels.unwrap_or_default();
    assert_eq!(
        labels.get(keys::INJECTED_LABEL).map(String::as_str),
        Some(keys::INJECTED_LABEL_VALUE)
    );
    assert!(labels.contains_key(&keys::hostport_label(31001)));
    assert!(labels.contains_key(&keys::hostport_label(31002)));
    cache.assert_invariants();
}

#[test]
fn assigns_ports_in_order() {
    let injector = HostPortInjector {
        allocator: Allocator::Order(OrderAssigner::starting_at(31000..=31002, 31002)),
        shutdown: Mutex::new(None),
    };
    assert!(injector.cache().is_none());

    let pod = injectable("http,8080");
    let rsp = injector.handle(&request("Pod", "CREATE", pod.clone()));
    assert!(rsp.allowed, "{}", message(&rsp));
    assert_eq!(host_ports(&patched(pod, &rsp)), vec![Some(31002), Some(31000)]);

    let pod = injectable("8080");
    let rsp = injector.handle(&request("Pod", "CREATE", pod.clone()));
    let pod = patched(pod, &rsp);
    assert_eq!(host_ports(&pod), vec![None, Some(31001)]);
}

#[test]
fn unmatched_ports_deny_without_allocating() {
    let injector = HostPortInjector::new(&config(31000, 31009));

    let rsp = injector.handle(&request("Pod", "CREATE", injectable("http,grpc")));
    assert!(!rsp.allowed);
    assert!(rsp.patch.is_none());
    assert!(
        message(&rsp).contains("not all ports match"),
        "{}",
        message(&rsp)
    );

    let cache = injector.cache().unwrap();
    assert!(cache.entries().iter().all(|e| e.quantity == 0));
}

#[test]
fn port_requested_twice_denies_without_allocating() {
    let injector = HostPortInjector::new(&config(31000, 31009));

    // `http` is container port 8081.
    let rsp = injector.handle(&request("Pod", "CREATE", injectable("http,8081")));
    assert!(!rsp.allowed);
    assert!(rsp.patch.is_none());
    assert!(
        message(&rsp).contains("not all ports match"),
        "{}",
        message(&rsp)
    );

    let cache = injector.cache().unwrap();
    assert!(cache.entries().iter().all(|e| e.quantity == 0));
}

#[test]
fn exhausted_range_denies() {
    let injector = HostPortInjector::new(&config(31000, 31000));

    let rsp = injector.handle(&request("Pod", "CREATE", injectable("http,8080")));
    assert!(!rsp.allowed);
    assert!(
        message(&rsp).contains("only 1 are available"),
        "{}",
        message(&rsp)
    );
    assert_eq!(injector.cache().unwrap().get(31000).unwrap().quantity, 0);
}

#[test]
fn missing_spec_denies() {
    let injector = HostPortInjector::new(&config(31000, 31009));
    let pod = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": "game",
            "annotations": {
                (keys::INJECT_ANNOTATION): keys::INJECT_ANNOTATION_VALUE,
                (keys::PORTS_ANNOTATION): "8080",
            },
        },
    });

    let rsp = injector.handle(&request("Pod", "CREATE", pod));
    assert!(!rsp.allowed);
    assert_eq!(message(&rsp), InjectError::MissingSpec.to_string());
}

#[test]
fn decoded_pod_takes_request_namespace() {
    let req = request("Pod", "CREATE", injectable("http"));
    let pod = decode_pod(&req).unwrap();
    assert_eq!(pod.metadata.namespace.as_deref(), Some("default"));

    let mut pod = injectable("http");
    pod["metadata"]["namespace"] = json!("games");
    let pod = decode_pod(&request("Pod", "CREATE", pod)).unwrap();
    assert_eq!(pod.metadata.namespace.as_deref(), Some("games"));
}

#[test]
fn passes_through_pods_that_did_not_opt_in() {
    let injector = HostPortInjector::new(&config(31000, 31009));

    for annotations in [json!({}), json!({ (keys::INJECT_ANNOTATION): "false" })] {
        let rsp = injector.handle(&request("Pod", "CREATE", game_pod(annotations)));
        assert!(rsp.allowed);
        assert!(rsp.patch.is_none());
    }
}

#[test]
fn ignores_updates_and_other_kinds() {
    let injector = HostPortInjector::new(&config(31000, 31009));

    let rsp = injector.handle(&request("Pod", "UPDATE", injectable("http")));
    assert!(rsp.allowed);
    assert!(rsp.patch.is_none());

    let rsp = injector.handle(&request("Deployment", "CREATE", injectable("http")));
    assert!(rsp.allowed);
    assert!(rsp.patch.is_none());

    let cache = injector.cache().unwrap();
    assert!(cache.entries().iter().all(|e| e.quantity == 0));
}

#[tokio::test]
async fn close_is_idempotent() {
    let (signal, drain) = drain::channel();
    let task = tokio::spawn(async move {
        drop(drain.signaled().await);
    });
    let injector = HostPortInjector {
        allocator: Allocator::Order(OrderAssigner::new(31000..=31009)),
        shutdown: Mutex::new(Some(Shutdown { signal, task })),
    };

    injector.close().await;
    assert!(injector.shutdown.lock().is_none());
    injector.close().await;

    HostPortInjector::new(&config(31000, 31009)).close().await;
}
