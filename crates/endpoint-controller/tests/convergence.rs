mod common;

use std::time::Duration;

use common::Cluster;
use common::NAMESPACE;
use endpoint_controller::mock::fixtures;
use k8s_openapi::api::core::v1::Pod;
use tokio_util::sync::CancellationToken;

fn pod(name: &str, app: &str, ip: &str, ready: bool) -> Pod {
    fixtures::pod(NAMESPACE, name, &[("app", app)], Some(ip), ready)
}

#[test_log::test(tokio::test)]
async fn mutations_in_any_order_converge_to_the_final_state() {
    let mut scrambled = Cluster::new(2);
    // Pods show up before their Service, change labels and go away while
    // earlier syncs already wrote objects.
    scrambled.apply_pod(pod("p1", "a", "10.0.0.1", true));
    scrambled.apply_pod(pod("p2", "b", "10.0.0.2", true));
    scrambled.settle().await;
    scrambled.apply_service(fixtures::service(NAMESPACE, "svc-a", &[("app", "a")], &[80]));
    scrambled.apply_pod(pod("p3", "a", "10.0.0.3", false));
    scrambled.settle().await;
    scrambled.apply_pod(fixtures::bumped(pod("p2", "a", "10.0.0.2", true)));
    scrambled.apply_pod(pod("p4", "a", "10.0.0.4", true));
    scrambled.delete_pod(pod("p1", "a", "10.0.0.1", true));
    scrambled.apply_pod(fixtures::bumped(pod("p3", "a", "10.0.0.3", true)));
    scrambled.settle().await;

    let mut fresh = Cluster::new(2);
    fresh.apply_service(fixtures::service(NAMESPACE, "svc-a", &[("app", "a")], &[80]));
    fresh.apply_pod(pod("p2", "a", "10.0.0.2", true));
    fresh.apply_pod(pod("p3", "a", "10.0.0.3", true));
    fresh.apply_pod(pod("p4", "a", "10.0.0.4", true));
    fresh.settle().await;

    similar_asserts::assert_eq!(
        scrambled.endpoints_members("svc-a"),
        fresh.endpoints_members("svc-a")
    );
    similar_asserts::assert_eq!(scrambled.slice_members("svc-a"), fresh.slice_members("svc-a"));
    for slice in scrambled.slices_of("svc-a") {
        assert!(slice.endpoints.len() <= 2);
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn concurrent_workers_converge_unrelated_services() {
    let mut cluster = Cluster::new(2);
    let services: Vec<String> = (0..8).map(|i| format!("svc-{i}")).collect();
    for (i, name) in services.iter().enumerate() {
        let app = format!("app-{i}");
        cluster.apply_service(fixtures::service(NAMESPACE, name, &[("app", app.as_str())], &[80]));
        for j in 0..3 {
            cluster.apply_pod(fixtures::pod(
                NAMESPACE,
                &format!("{name}-pod-{j}"),
                &[("app", app.as_str())],
                Some(format!("10.0.{i}.{j}").as_str()),
                true,
            ));
        }
    }

    let token = CancellationToken::new();
    let endpoints = tokio::spawn({
        let controller = cluster.endpoints.clone();
        let token = token.clone();
        async move { controller.run(4, token).await }
    });
    let slices = tokio::spawn({
        let controller = cluster.slices.clone();
        let token = token.clone();
        async move { controller.run(4, token).await }
    });

    let converged = |cluster: &Cluster| {
        services.iter().all(|name| {
            cluster.endpoints_members(name).len() == 3 && cluster.slice_members(name).len() == 3
        })
    };
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !converged(&cluster) {
        assert!(tokio::time::Instant::now() < deadline, "services did not converge");
        cluster.pump();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    token.cancel();
    endpoints.await.unwrap();
    slices.await.unwrap();

    for name in &services {
        let mut sizes: Vec<usize> = cluster
            .slices_of(name)
            .iter()
            .map(|slice| slice.endpoints.len())
            .collect();
        sizes.sort_unstable();
        similar_asserts::assert_eq!(sizes, vec![1, 2]);
    }
}
