//! Host index construction.
//!
//! Maps every way a service can be addressed — kube-dns names, cluster
//! IP, load-balancer ingress IPs, annotated hostnames, node addresses
//! with node ports — to the [`App`] to activate and relay to. The map is
//! built whole from a snapshot and published atomically; readers never
//! see a partial rebuild.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use http::Uri;
use k8s_openapi::api::core::v1::Service;
use tracing::{debug, error};

use osiris_core::annotations::{self, clean_value};
use osiris_core::{App, AppKind, WorkloadRef};

/// Annotations of the workloads the indexed services point at, keyed by
/// workload identity.
pub type WorkloadAnnotations = HashMap<WorkloadRef, BTreeMap<String, String>>;

/// Build a fresh host→app index from a cluster snapshot.
///
/// Services are iterated in `(namespace, name)` order, so when two
/// services claim the same host the winner is deterministic: the last
/// writer in that order.
pub fn build_index(
    services: &BTreeMap<(String, String), Service>,
    workloads: &WorkloadAnnotations,
    node_addresses: &BTreeSet<String>,
) -> HashMap<String, Arc<App>> {
    let mut apps_by_host = HashMap::new();
    for service in services.values() {
        index_service(service, workloads, node_addresses, &mut apps_by_host);
    }
    apps_by_host
}

fn index_service(
    service: &Service,
    workloads: &WorkloadAnnotations,
    node_addresses: &BTreeSet<String>,
    apps_by_host: &mut HashMap<String, Arc<App>>,
) {
    let namespace = match service.metadata.namespace.as_deref() {
        Some(ns) => ns,
        None => return,
    };
    let service_name = match service.metadata.name.as_deref() {
        Some(name) => name,
        None => return,
    };
    let empty = BTreeMap::new();
    let svc_annotations = service.metadata.annotations.as_ref().unwrap_or(&empty);

    let (kind, name) = if let Some(raw) = svc_annotations.get(annotations::DEPLOYMENT) {
        (AppKind::Deployment, clean_value(raw))
    } else if let Some(raw) = svc_annotations.get(annotations::STATEFULSET) {
        (AppKind::StatefulSet, clean_value(raw))
    } else {
        return;
    };
    if name.is_empty() {
        return;
    }

    let workload = WorkloadRef::new(namespace, kind, name);
    let workload_annotations = workloads.get(&workload);
    let dependencies = workload_annotations
        .and_then(|a| a.get(annotations::DEPENDENCIES))
        .map(|raw| annotations::parse_dependencies(raw))
        .unwrap_or_default();
    let min_replicas = workload_annotations
        .and_then(|a| a.get(annotations::MIN_REPLICAS))
        .and_then(|raw| annotations::parse_min_replicas(raw))
        .unwrap_or(1);

    let spec = match service.spec.as_ref() {
        Some(spec) => spec,
        None => return,
    };
    let cluster_ip = match spec.cluster_ip.as_deref() {
        Some(ip) if !ip.is_empty() && ip != "None" => ip,
        _ => return,
    };
    let ports = match spec.ports.as_ref() {
        Some(ports) if !ports.is_empty() => ports,
        _ => return,
    };

    let dns_names = [
        format!("{service_name}.{namespace}"),
        format!("{service_name}.{namespace}.svc"),
        format!("{service_name}.{namespace}.svc.cluster"),
        format!("{service_name}.{namespace}.svc.cluster.local"),
    ];

    // The "default" ingress port: requests arriving through an ingress
    // controller carry a bare hostname, and after activation the request
    // has to be forwarded to exactly one service port.
    let ingress_default_port: Option<i32> = svc_annotations
        .get(annotations::INGRESS_DEFAULT_PORT)
        .and_then(|raw| clean_value(raw).parse().ok())
        .or_else(|| infer_ingress_default_port(ports));

    let lb_ingress_ips: Vec<&str> = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| {
            ingress
                .iter()
                .filter_map(|i| i.ip.as_deref())
                .filter(|ip| !ip.is_empty())
                .collect()
        })
        .unwrap_or_default();

    // BTreeMap order keeps numbered hostname annotations deterministic.
    let ingress_hostnames: Vec<&str> = svc_annotations
        .iter()
        .filter(|(k, _)| annotations::is_ingress_hostname_key(k))
        .map(|(_, v)| clean_value(v))
        .filter(|v| !v.is_empty())
        .collect();
    let lb_hostnames: Vec<&str> = svc_annotations
        .iter()
        .filter(|(k, _)| annotations::is_load_balancer_hostname_key(k))
        .map(|(_, v)| clean_value(v))
        .filter(|v| !v.is_empty())
        .collect();

    for port_spec in ports {
        let port = port_spec.port;
        let target_url: Uri = match format!("http://{cluster_ip}:{port}").parse() {
            Ok(uri) => uri,
            Err(e) => {
                error!(
                    service = service_name,
                    namespace, port, error = %e,
                    "error building target URL for service port"
                );
                continue;
            }
        };
        let app = Arc::new(App {
            namespace: namespace.to_string(),
            service_name: service_name.to_string(),
            name: name.to_string(),
            kind,
            dependencies: dependencies.clone(),
            target_url,
            min_replicas,
        });

        // Port 80 is also addressable without a port suffix.
        if port == 80 {
            for dns_name in &dns_names {
                apps_by_host.insert(dns_name.clone(), app.clone());
            }
            apps_by_host.insert(cluster_ip.to_string(), app.clone());
            for ip in &lb_ingress_ips {
                apps_by_host.insert((*ip).to_string(), app.clone());
            }
            for hostname in &lb_hostnames {
                apps_by_host.insert((*hostname).to_string(), app.clone());
            }
        }
        // Ingress hostnames arrive bare; they map to the default port.
        if Some(port) == ingress_default_port {
            for hostname in &ingress_hostnames {
                apps_by_host.insert((*hostname).to_string(), app.clone());
            }
        }

        // Everything is also addressable as host:port.
        for dns_name in &dns_names {
            apps_by_host.insert(format!("{dns_name}:{port}"), app.clone());
        }
        apps_by_host.insert(format!("{cluster_ip}:{port}"), app.clone());
        for ip in &lb_ingress_ips {
            apps_by_host.insert(format!("{ip}:{port}"), app.clone());
        }
        for hostname in &lb_hostnames {
            apps_by_host.insert(format!("{hostname}:{port}"), app.clone());
        }

        // Node addresses with the node port, when one is exposed.
        if let Some(node_port) = port_spec.node_port {
            if node_port != 0 {
                for address in node_addresses {
                    apps_by_host.insert(format!("{address}:{node_port}"), app.clone());
                }
            }
        }
    }

    debug!(
        service = service_name,
        namespace,
        workload = %workload,
        "indexed service"
    );
}

/// Infer the default ingress port when the annotation is absent: the
/// sole port if there is one, else the port named `http`, else 80 when
/// the service exposes it.
fn infer_ingress_default_port(
    ports: &[k8s_openapi::api::core::v1::ServicePort],
) -> Option<i32> {
    if ports.len() == 1 {
        return Some(ports[0].port);
    }
    let mut found_port_80 = false;
    for port in ports {
        if port.name.as_deref() == Some("http") {
            return Some(port.port);
        }
        if port.port == 80 {
            found_port_80 = true;
        }
    }
    found_port_80.then_some(80)
}

#[cfg(test)]
mod tests {
    use super::*;

    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, ServicePort, ServiceSpec, ServiceStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn port(port: i32, name: Option<&str>, node_port: Option<i32>) -> ServicePort {
        ServicePort {
            port,
            name: name.map(|n| n.to_string()),
            node_port,
            ..Default::default()
        }
    }

    fn service(
        namespace: &str,
        name: &str,
        annotations: &[(&str, &str)],
        cluster_ip: &str,
        ports: Vec<ServicePort>,
        lb_ips: &[&str],
    ) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some(cluster_ip.to_string()),
                ports: Some(ports),
                ..Default::default()
            }),
            status: (!lb_ips.is_empty()).then(|| ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(
                        lb_ips
                            .iter()
                            .map(|ip| LoadBalancerIngress {
                                ip: Some(ip.to_string()),
                                ..Default::default()
                            })
                            .collect(),
                    ),
                }),
                ..Default::default()
            }),
        }
    }

    fn services_map(services: Vec<Service>) -> BTreeMap<(String, String), Service> {
        services
            .into_iter()
            .map(|s| {
                (
                    (
                        s.metadata.namespace.clone().unwrap(),
                        s.metadata.name.clone().unwrap(),
                    ),
                    s,
                )
            })
            .collect()
    }

    fn no_workloads() -> WorkloadAnnotations {
        HashMap::new()
    }

    fn no_nodes() -> BTreeSet<String> {
        BTreeSet::new()
    }

    #[test]
    fn service_without_workload_annotation_is_not_indexed() {
        let svc = service("ns", "web", &[], "10.0.0.1", vec![port(80, None, None)], &[]);
        let index = build_index(&services_map(vec![svc]), &no_workloads(), &no_nodes());
        assert!(index.is_empty());
    }

    #[test]
    fn port_80_registers_bare_and_suffixed_hosts() {
        let svc = service(
            "ns",
            "web",
            &[("osiris.dm.gg/deployment", "web")],
            "10.0.0.1",
            vec![port(80, None, None)],
            &["1.2.3.4"],
        );
        let index = build_index(&services_map(vec![svc]), &no_workloads(), &no_nodes());

        for host in [
            "web.ns",
            "web.ns.svc",
            "web.ns.svc.cluster",
            "web.ns.svc.cluster.local",
            "10.0.0.1",
            "1.2.3.4",
            "web.ns:80",
            "web.ns.svc:80",
            "web.ns.svc.cluster:80",
            "web.ns.svc.cluster.local:80",
            "10.0.0.1:80",
            "1.2.3.4:80",
        ] {
            let app = index.get(host).unwrap_or_else(|| panic!("missing {host}"));
            assert_eq!(app.name, "web");
            assert_eq!(app.kind, AppKind::Deployment);
            assert_eq!(app.target_url.to_string(), "http://10.0.0.1:80/");
        }
        assert_eq!(index.len(), 12);
    }

    #[test]
    fn non_80_port_registers_only_suffixed_hosts() {
        let svc = service(
            "ns",
            "api",
            &[("osiris.dm.gg/deployment", "api")],
            "10.0.0.2",
            vec![port(8080, None, None)],
            &[],
        );
        let index = build_index(&services_map(vec![svc]), &no_workloads(), &no_nodes());

        assert!(index.get("api.ns").is_none());
        assert!(index.get("10.0.0.2").is_none());
        let app = index.get("api.ns:8080").unwrap();
        assert_eq!(app.target_url.to_string(), "http://10.0.0.2:8080/");
        assert_eq!(index.len(), 5);
    }

    #[test]
    fn every_entry_targets_the_port_it_was_formed_from() {
        let svc = service(
            "ns",
            "multi",
            &[("osiris.dm.gg/deployment", "multi")],
            "10.0.0.3",
            vec![port(80, Some("http"), None), port(9090, Some("admin"), None)],
            &[],
        );
        let index = build_index(&services_map(vec![svc]), &no_workloads(), &no_nodes());

        for (host, app) in &index {
            let expected_port = match host.rsplit_once(':') {
                Some((_, port)) => port.parse::<u16>().unwrap(),
                // Bare keys come from port 80 here (the `http` port).
                None => 80,
            };
            assert_eq!(
                app.target_url.port_u16(),
                Some(expected_port),
                "host {host} routed to {}",
                app.target_url
            );
        }
    }

    #[test]
    fn statefulset_annotation_binds_the_statefulset_kind() {
        let svc = service(
            "data",
            "db",
            &[("osiris.dm.gg/statefulset", "'db'")],
            "10.0.0.4",
            vec![port(5432, None, None)],
            &[],
        );
        let index = build_index(&services_map(vec![svc]), &no_workloads(), &no_nodes());

        let app = index.get("db.data:5432").unwrap();
        assert_eq!(app.kind, AppKind::StatefulSet);
        assert_eq!(app.name, "db");
        assert_eq!(app.workload(), WorkloadRef::new("data", AppKind::StatefulSet, "db"));
    }

    #[test]
    fn ingress_hostnames_map_to_the_annotated_default_port() {
        let svc = service(
            "ns",
            "web",
            &[
                ("osiris.dm.gg/deployment", "web"),
                ("osiris.dm.gg/ingressDefaultPort", "8443"),
                ("osiris.dm.gg/ingressHostname", "web.example.com"),
                ("osiris.dm.gg/ingressHostname-1", "'www.example.com'"),
            ],
            "10.0.0.5",
            vec![port(8080, None, None), port(8443, None, None)],
            &[],
        );
        let index = build_index(&services_map(vec![svc]), &no_workloads(), &no_nodes());

        let app = index.get("web.example.com").unwrap();
        assert_eq!(app.target_url.port_u16(), Some(8443));
        let app = index.get("www.example.com").unwrap();
        assert_eq!(app.target_url.port_u16(), Some(8443));
    }

    #[test]
    fn ingress_default_port_inference() {
        // Sole port wins.
        assert_eq!(
            infer_ingress_default_port(&[port(9999, None, None)]),
            Some(9999)
        );
        // Port named http wins over 80.
        assert_eq!(
            infer_ingress_default_port(&[port(80, None, None), port(8080, Some("http"), None)]),
            Some(8080)
        );
        // Exposed port 80 is the fallback.
        assert_eq!(
            infer_ingress_default_port(&[port(80, None, None), port(9090, None, None)]),
            Some(80)
        );
        // Otherwise there is no default.
        assert_eq!(
            infer_ingress_default_port(&[port(8080, None, None), port(9090, None, None)]),
            None
        );
    }

    #[test]
    fn load_balancer_hostnames_register_with_and_without_suffix_on_port_80() {
        let svc = service(
            "ns",
            "web",
            &[
                ("osiris.dm.gg/deployment", "web"),
                ("osiris.dm.gg/loadBalancerHostname", "lb.example.com"),
                ("osiris.dm.gg/loadBalancerHostname-2", "lb2.example.com"),
            ],
            "10.0.0.6",
            vec![port(80, None, None), port(9090, None, None)],
            &[],
        );
        let index = build_index(&services_map(vec![svc]), &no_workloads(), &no_nodes());

        assert_eq!(index.get("lb.example.com").unwrap().target_url.port_u16(), Some(80));
        assert_eq!(index.get("lb2.example.com").unwrap().target_url.port_u16(), Some(80));
        assert_eq!(
            index.get("lb.example.com:9090").unwrap().target_url.port_u16(),
            Some(9090)
        );
    }

    #[test]
    fn node_ports_register_every_node_address() {
        let svc = service(
            "ns",
            "web",
            &[("osiris.dm.gg/deployment", "web")],
            "10.0.0.7",
            vec![port(8080, None, Some(30123))],
            &[],
        );
        let nodes: BTreeSet<String> =
            ["192.168.1.10".to_string(), "192.168.1.11".to_string()].into();
        let index = build_index(&services_map(vec![svc]), &no_workloads(), &nodes);

        assert!(index.contains_key("192.168.1.10:30123"));
        assert!(index.contains_key("192.168.1.11:30123"));
        assert_eq!(
            index.get("192.168.1.10:30123").unwrap().target_url.port_u16(),
            Some(8080)
        );
    }

    #[test]
    fn workload_annotations_feed_dependencies_and_min_replicas() {
        let workload = WorkloadRef::new("ns", AppKind::Deployment, "web");
        let mut workloads = HashMap::new();
        workloads.insert(
            workload,
            BTreeMap::from([
                (
                    "osiris.dm.gg/dependencies".to_string(),
                    "deployment:ns/db,statefulset:ns/cache".to_string(),
                ),
                ("osiris.dm.gg/minReplicas".to_string(), "2".to_string()),
            ]),
        );
        let svc = service(
            "ns",
            "web",
            &[("osiris.dm.gg/deployment", "web")],
            "10.0.0.8",
            vec![port(80, None, None)],
            &[],
        );
        let index = build_index(&services_map(vec![svc]), &workloads, &no_nodes());

        let app = index.get("web.ns").unwrap();
        assert_eq!(app.min_replicas, 2);
        assert_eq!(
            app.dependencies,
            vec![
                WorkloadRef::new("ns", AppKind::Deployment, "db"),
                WorkloadRef::new("ns", AppKind::StatefulSet, "cache"),
            ]
        );
    }

    #[test]
    fn colliding_hosts_resolve_to_the_last_service_in_sorted_order() {
        let first = service(
            "a-ns",
            "svc-a",
            &[
                ("osiris.dm.gg/deployment", "app-a"),
                ("osiris.dm.gg/ingressHostname", "shared.example.com"),
            ],
            "10.0.0.9",
            vec![port(80, None, None)],
            &[],
        );
        let second = service(
            "b-ns",
            "svc-b",
            &[
                ("osiris.dm.gg/deployment", "app-b"),
                ("osiris.dm.gg/ingressHostname", "shared.example.com"),
            ],
            "10.0.0.10",
            vec![port(80, None, None)],
            &[],
        );
        let index = build_index(
            &services_map(vec![second.clone(), first.clone()]),
            &no_workloads(),
            &no_nodes(),
        );
        assert_eq!(index.get("shared.example.com").unwrap().name, "app-b");

        // Insertion order into the snapshot is irrelevant.
        let again = build_index(
            &services_map(vec![first, second]),
            &no_workloads(),
            &no_nodes(),
        );
        assert_eq!(again.get("shared.example.com").unwrap().name, "app-b");
    }

    #[test]
    fn rebuilding_from_the_same_snapshot_is_identical() {
        let svc = service(
            "ns",
            "web",
            &[
                ("osiris.dm.gg/deployment", "web"),
                ("osiris.dm.gg/ingressHostname", "web.example.com"),
            ],
            "10.0.0.11",
            vec![port(80, None, Some(31000)), port(9090, None, None)],
            &["5.6.7.8"],
        );
        let services = services_map(vec![svc]);
        let nodes: BTreeSet<String> = ["192.168.0.1".to_string()].into();

        let first = build_index(&services, &no_workloads(), &nodes);
        let second = build_index(&services, &no_workloads(), &nodes);

        assert_eq!(first.len(), second.len());
        for (host, app) in &first {
            assert_eq!(second.get(host), Some(app), "host {host} differs");
        }
    }

    #[test]
    fn headless_service_is_skipped() {
        let svc = service(
            "ns",
            "headless",
            &[("osiris.dm.gg/deployment", "app")],
            "None",
            vec![port(80, None, None)],
            &[],
        );
        let index = build_index(&services_map(vec![svc]), &no_workloads(), &no_nodes());
        assert!(index.is_empty());
    }
}
