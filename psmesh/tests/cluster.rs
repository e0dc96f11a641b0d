//! Whole-job tests over the in-process network.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{client, echo_server, request, Cluster};
use psmesh::{
    server_rank_to_id, worker_rank_to_id, PostofficeError, Role, VanConfig, ALL_GROUPS,
    SCHEDULER_ID, SERVER_GROUP, WORKER_GROUP,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_job_starts_and_assigns_ids() {
    let cluster = Cluster::start(2, 1, VanConfig::default()).await;

    let scheduler = cluster.scheduler.van().my_node();
    assert_eq!(scheduler.id, SCHEDULER_ID);
    assert_eq!(scheduler.role, Role::Scheduler);

    let worker_ids: HashSet<i32> = cluster.workers.iter().map(|po| po.van().my_node().id).collect();
    let expected: HashSet<i32> = (0..2).map(worker_rank_to_id).collect();
    assert_eq!(worker_ids, expected);
    assert_eq!(cluster.servers[0].van().my_node().id, server_rank_to_id(0));

    for po in cluster.all() {
        assert!(po.van().is_ready());
        assert!(!po.is_recovery());
    }
    assert_eq!(cluster.servers[0].my_rank(), 0);
    assert_eq!(cluster.scheduler.van().connected_ids(), vec![8, 9, 11]);
    // Workers talk to the scheduler and servers, never to each other.
    assert_eq!(cluster.workers[0].van().connected_ids(), vec![1, 8]);

    cluster.finalize().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ids_follow_address_order() {
    let cluster = Cluster::start(3, 2, VanConfig::default()).await;

    let mut workers: Vec<(u16, i32)> = cluster
        .workers
        .iter()
        .map(|po| {
            let node = po.van().my_node();
            (node.port, node.id)
        })
        .collect();
    workers.sort_unstable();
    let ids: Vec<i32> = workers.into_iter().map(|(_, id)| id).collect();
    assert_eq!(ids, vec![9, 11, 13], "same host, so ranks follow ports");

    cluster.finalize().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_reaches_every_server() {
    let cluster = Cluster::start(2, 3, VanConfig::default()).await;

    let seen: Vec<_> = cluster.servers.iter().map(echo_server).collect();
    let (app, replies) = client(&cluster.workers[0]);

    let ts = request(&cluster.workers[0], &app, SERVER_GROUP, b"pull");
    app.wait_request_timeout(ts, Duration::from_secs(5))
        .await
        .expect("every server answered");
    assert_eq!(app.num_response(ts), Ok(3));
    assert!(replies.lock().expect("lock").iter().all(|r| r.as_ref() == b"pull"));

    let sender = cluster.workers[0].van().my_node().id;
    for server in &seen {
        assert_eq!(server.lock().expect("lock").get(&sender), Some(&vec![ts]));
    }

    cluster.finalize().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_message_waits_for_late_customer() {
    let cluster = Cluster::start(1, 1, VanConfig::default()).await;
    let (app, _) = client(&cluster.workers[0]);

    let ts = request(&cluster.workers[0], &app, SERVER_GROUP, b"early");
    tokio::time::sleep(Duration::from_millis(50)).await;
    echo_server(&cluster.servers[0]);

    app.wait_request_timeout(ts, Duration::from_secs(5))
        .await
        .expect("delivered once the server registered");

    cluster.finalize().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_requests_in_flight() {
    let cluster = Cluster::start(2, 2, VanConfig::default()).await;
    for server in &cluster.servers {
        echo_server(server);
    }

    let mut tasks = Vec::new();
    for worker in &cluster.workers {
        let worker = Arc::clone(worker);
        tasks.push(tokio::spawn(async move {
            let (app, replies) = client(&worker);
            let stamps: Vec<i32> = (0..50)
                .map(|_| request(&worker, &app, SERVER_GROUP, b"x"))
                .collect();
            for ts in stamps {
                app.wait_request_timeout(ts, Duration::from_secs(5))
                    .await
                    .expect("answered");
            }
            assert_eq!(replies.lock().expect("lock").len(), 100);
        }));
    }
    for task in tasks {
        task.await.expect("worker task");
    }

    let metrics = cluster.workers[0].van().metrics();
    assert!(metrics.sent_messages >= 100);
    assert!(metrics.recv_messages >= 100);

    cluster.finalize().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_group_barriers() {
    let cluster = Cluster::start(2, 1, VanConfig::default()).await;

    let mut tasks = Vec::new();
    for worker in &cluster.workers {
        let worker = Arc::clone(worker);
        tasks.push(tokio::spawn(async move {
            worker
                .barrier_timeout(WORKER_GROUP, Duration::from_secs(5))
                .await
        }));
    }
    for task in tasks {
        task.await.expect("barrier task").expect("workers released");
    }

    // A single server is its own barrier.
    cluster.servers[0]
        .barrier_timeout(SERVER_GROUP, Duration::from_millis(100))
        .await
        .expect("trivial group");

    let result = cluster.servers[0]
        .barrier_timeout(WORKER_GROUP, Duration::from_millis(100))
        .await;
    assert!(matches!(
        result,
        Err(PostofficeError::NotInGroup {
            group: WORKER_GROUP,
            role: Role::Server
        })
    ));

    cluster.finalize().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_barrier_waits_for_every_member() {
    let cluster = Cluster::start(2, 1, VanConfig::default()).await;

    let first = cluster.workers[0]
        .barrier_timeout(ALL_GROUPS, Duration::from_millis(100))
        .await;
    assert!(matches!(
        first,
        Err(PostofficeError::BarrierTimeout { group: ALL_GROUPS })
    ));

    // The arrival above still counts; the remaining members complete the round.
    let rest = [&cluster.scheduler, &cluster.workers[1], &cluster.servers[0]];
    let mut tasks = Vec::new();
    for po in rest {
        let po = Arc::clone(po);
        tasks.push(tokio::spawn(async move {
            po.barrier_timeout(ALL_GROUPS, Duration::from_secs(5)).await
        }));
    }
    for task in tasks {
        task.await.expect("barrier task").expect("released");
    }
    // Let the stray release reach the first worker before the closing barrier.
    tokio::time::sleep(Duration::from_millis(100)).await;

    cluster.finalize().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exit_callbacks_run() {
    let cluster = Cluster::start(1, 1, VanConfig::default()).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for po in cluster.all() {
        let tx = tx.clone();
        let role = po.role();
        po.set_exit_callback(move || {
            let _ = tx.send(role);
        });
    }
    drop(tx);

    cluster.finalize().await;

    let mut roles = Vec::new();
    while let Some(role) = rx.recv().await {
        roles.push(role);
    }
    assert_eq!(roles.len(), 3);
}
