//! Cluster heal workflow, from a direct heal call up to the full loop of
//! timer → confirmed failure → replacement.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::ManagedFactory;
use proxy_gate::algorithms::Algorithm;
use proxy_gate::balancer::LoadBalancer;
use proxy_gate::cluster::{ClusterManager, ClusterOptions};
use proxy_gate::gateway::Gateway;
use proxy_gate::health::HealthChecker;
use proxy_gate::upstream::UpstreamClient;
use proxy_gate::upstream::{ClientConfig, NoSystemProxy};

fn quick_checker() -> HealthChecker {
    HealthChecker::new(
        "probe.test".to_string(),
        80,
        Duration::from_millis(500),
        Duration::from_secs(2),
    )
}

fn build_manager(heartbeat_ms: Vec<u64>) -> (Arc<ClusterManager>, Arc<ManagedFactory>) {
    let factory = Arc::new(ManagedFactory::default());
    let balancer = Arc::new(LoadBalancer::new(Algorithm::Polling, vec![]));
    let gateway = Arc::new(Gateway::new(
        "127.0.0.1",
        balancer,
        quick_checker(),
        heartbeat_ms,
    ));
    let manager = ClusterManager::new(factory.clone(), Arc::new(NoSystemProxy), gateway);
    (manager, factory)
}

fn configs(ids: &[&str]) -> Vec<ClientConfig> {
    ids.iter().map(|id| ClientConfig::new(*id)).collect()
}

fn registry_ports(manager: &Arc<ClusterManager>) -> HashSet<u16> {
    manager
        .gateway()
        .balancer()
        .targets()
        .into_iter()
        .map(|t| t.id)
        .collect()
}

async fn pool_ports(manager: &Arc<ClusterManager>, factory: &ManagedFactory) -> HashSet<u16> {
    let mut ports = HashSet::new();
    for conf_id in manager.pool_conf_ids().await {
        if let Some(port) = factory.client(&conf_id).and_then(|c| c.local_port()) {
            ports.insert(port);
        }
    }
    ports
}

#[tokio::test]
async fn heal_restores_pool_from_free_configs() {
    // 5 candidate configs, 3 in use, 2 free.
    let (manager, factory) = build_manager(vec![600_000]);
    manager
        .start_cluster(
            configs(&["c1", "c2", "c3", "c4", "c5"]),
            ClusterOptions { size: 3, port: 0 },
        )
        .await
        .unwrap();

    let in_use: HashSet<String> = manager.pool_conf_ids().await.into_iter().collect();
    assert_eq!(in_use.len(), 3);
    let free: HashSet<String> = ["c1", "c2", "c3", "c4", "c5"]
        .iter()
        .map(|s| s.to_string())
        .filter(|id| !in_use.contains(id))
        .collect();

    // Fail one member and heal.
    let victim_id = in_use.iter().next().unwrap().clone();
    let victim_target = manager
        .gateway()
        .balancer()
        .targets()
        .into_iter()
        .find(|t| t.conf_id == victim_id)
        .unwrap();
    manager.heal_cluster(vec![victim_target]).await.unwrap();

    // Pool is back to size, the replacement came only from the free set.
    assert_eq!(manager.pool_len().await, 3);
    let after: HashSet<String> = manager.pool_conf_ids().await.into_iter().collect();
    assert!(!after.contains(&victim_id));
    let new_members: Vec<&String> = after.difference(&in_use).collect();
    assert_eq!(new_members.len(), 1);
    assert!(
        free.contains(new_members[0]),
        "replacement {} not drawn from the free configs {free:?}",
        new_members[0]
    );

    // The registry exactly mirrors the final pool's ports.
    assert_eq!(
        registry_ports(&manager),
        pool_ports(&manager, &factory).await
    );
    assert_eq!(manager.dead_map().await.get(&victim_id), Some(&1));
    manager.stop().await;
}

#[tokio::test]
async fn dead_map_accumulates_and_resets_on_stop() {
    let (manager, _factory) = build_manager(vec![600_000]);
    manager
        .start_cluster(
            configs(&["c1", "c2", "c3", "c4", "c5"]),
            ClusterOptions { size: 2, port: 0 },
        )
        .await
        .unwrap();

    // Two heal cycles against different members: counters only grow.
    for _ in 0..2 {
        let victim = manager.gateway().balancer().targets().remove(0);
        manager.heal_cluster(vec![victim]).await.unwrap();
    }
    let dead = manager.dead_map().await;
    assert_eq!(dead.values().sum::<u32>(), 2);

    manager.stop().await;
    assert!(manager.dead_map().await.is_empty());
}

#[tokio::test]
async fn heal_tolerates_short_config_pool() {
    // Every candidate is in use: a lost member cannot be replaced, but the
    // cluster keeps serving with the survivors.
    let (manager, factory) = build_manager(vec![600_000]);
    manager
        .start_cluster(
            configs(&["c1", "c2", "c3"]),
            ClusterOptions { size: 3, port: 0 },
        )
        .await
        .unwrap();

    let victim = manager.gateway().balancer().targets().remove(0);
    manager.heal_cluster(vec![victim.clone()]).await.unwrap();

    assert_eq!(manager.pool_len().await, 2);
    assert!(!manager
        .pool_conf_ids()
        .await
        .contains(&victim.conf_id.to_string()));
    assert_eq!(
        registry_ports(&manager),
        pool_ports(&manager, &factory).await
    );
    manager.stop().await;
}

#[tokio::test]
async fn heal_retries_replacement_that_failed_to_connect() {
    let (manager, factory) = build_manager(vec![600_000]);
    manager
        .start_cluster(
            configs(&["c1", "c2", "c3", "c4"]),
            ClusterOptions { size: 3, port: 0 },
        )
        .await
        .unwrap();

    let in_use: HashSet<String> = manager.pool_conf_ids().await.into_iter().collect();
    let free_id = ["c1", "c2", "c3", "c4"]
        .iter()
        .find(|id| !in_use.contains(**id))
        .unwrap()
        .to_string();

    // First heal: the only free config refuses to connect, so the pool runs
    // degraded with the replacement kept unconnected.
    factory.fail_connects_for(&free_id);
    let victim = manager.gateway().balancer().targets().remove(0);
    manager.heal_cluster(vec![victim]).await.unwrap();
    assert_eq!(manager.pool_len().await, 3);
    assert_eq!(manager.gateway().balancer().len(), 2);

    // Next heal cycle: the unconnected member counts as abnormal and is
    // replaced by the config freed in the first cycle.
    factory.allow_connects_for(&free_id);
    manager.heal_cluster(vec![]).await.unwrap();
    assert_eq!(manager.pool_len().await, 3);
    assert_eq!(manager.gateway().balancer().len(), 3);
    assert_eq!(
        registry_ports(&manager),
        pool_ports(&manager, &factory).await
    );
    manager.stop().await;
}

#[tokio::test]
async fn full_loop_replaces_member_that_fails_twice() {
    // Fast heartbeat so the timer drives the whole loop.
    let (manager, factory) = build_manager(vec![100]);
    manager
        .start_cluster(
            configs(&["c1", "c2", "c3", "c4", "c5"]),
            ClusterOptions { size: 3, port: 0 },
        )
        .await
        .unwrap();

    let in_use: HashSet<String> = manager.pool_conf_ids().await.into_iter().collect();
    let victim_id = in_use.iter().next().unwrap().clone();
    factory.client(&victim_id).unwrap().break_upstream();

    // The timer confirms the failure over two probe rounds and the heal
    // listener replaces the member.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let mut healed = false;
    while tokio::time::Instant::now() < deadline {
        let ids = manager.pool_conf_ids().await;
        if !ids.contains(&victim_id) && ids.len() == 3 {
            healed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(healed, "member was never replaced");

    assert_eq!(
        registry_ports(&manager),
        pool_ports(&manager, &factory).await
    );
    assert_eq!(manager.dead_map().await.get(&victim_id), Some(&1));
    manager.stop().await;
}

#[tokio::test]
async fn flaky_member_survives_the_full_loop() {
    let (manager, factory) = build_manager(vec![100]);
    manager
        .start_cluster(
            configs(&["c1", "c2", "c3"]),
            ClusterOptions { size: 3, port: 0 },
        )
        .await
        .unwrap();

    let member_id = manager.pool_conf_ids().await.remove(0);
    // Fails the first probe of one round, passes the re-probe.
    factory.client(&member_id).unwrap().flake_upstream(1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let ids = manager.pool_conf_ids().await;
    assert!(ids.contains(&member_id), "flaky member was replaced");
    assert!(manager.dead_map().await.is_empty());
    manager.stop().await;
}
