//! End-to-end routing scenarios driven through the peer library.

mod common;

use common::{options, start_default_manager, start_manager};
use serde_json::{json, Map, Value};
use std::time::Duration;
use switchboard_manager::{AuthPolicy, Store};
use switchboard_peer::{Client, ServiceBuilder};

fn echo_service() -> ServiceBuilder {
    ServiceBuilder::new("Echo").attribute(
        "echo",
        "(*args, **kwargs) -> [args, kwargs]",
        |args, kwargs| Ok(json!([args, kwargs])),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn echo_round_trip() {
    let manager = start_default_manager().await;
    let service = echo_service().serve(options(manager.addr)).await.unwrap();

    let client = Client::connect(options(manager.addr)).await.unwrap();
    client.link("Echo").await.unwrap();
    let result = client
        .request("Echo", "echo", vec![json!("hello")], Map::new())
        .await
        .unwrap();
    assert_eq!(result, json!([["hello"], {}]));

    service.shutdown().await;
    client.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_service_returns_an_error() {
    let manager = start_default_manager().await;
    let client = Client::connect(options(manager.addr)).await.unwrap();

    let err = client
        .request_with_uid("Nope", "anything", vec![], Map::new(), "u2")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Nope"), "got: {err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_requires_a_link() {
    let manager = start_default_manager().await;
    let _service = echo_service().serve(options(manager.addr)).await.unwrap();

    let client = Client::connect(options(manager.addr)).await.unwrap();
    let err = client
        .request("Echo", "echo", vec![], Map::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not linked"), "got: {err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn max_clients_frees_a_slot_on_disconnect() {
    let manager = start_default_manager().await;
    let _service = ServiceBuilder::new("Solo")
        .max_clients(1)
        .attribute("ping", "() -> str", |_, _| Ok(json!("pong")))
        .serve(options(manager.addr))
        .await
        .unwrap();

    let client_a = Client::connect_as("A", options(manager.addr)).await.unwrap();
    client_a.link("Solo").await.unwrap();

    let client_b = Client::connect_as("B", options(manager.addr)).await.unwrap();
    let err = client_b.link("Solo").await.unwrap_err();
    assert!(err.to_string().contains("maximum number"), "got: {err}");

    client_a.disconnect().await;

    // The manager purges the departed client's links asynchronously.
    let mut linked = false;
    for _ in 0..50 {
        if client_b.link("Solo").await.is_ok() {
            linked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(linked, "client B never acquired the freed slot");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn notifications_fan_out_to_linked_clients_only() {
    let manager = start_default_manager().await;
    let ticker = ServiceBuilder::new("Ticker")
        .serve(options(manager.addr))
        .await
        .unwrap();

    let mut linked_a = Client::connect_as("A", options(manager.addr)).await.unwrap();
    let mut linked_b = Client::connect_as("B", options(manager.addr)).await.unwrap();
    let mut bystander = Client::connect_as("C", options(manager.addr)).await.unwrap();
    linked_a.link("Ticker").await.unwrap();
    linked_b.link("Ticker").await.unwrap();

    let mut notif_a = linked_a.notifications().unwrap();
    let mut notif_b = linked_b.notifications().unwrap();
    let mut notif_c = bystander.notifications().unwrap();

    let payload = json!([[1], {"t": "a"}]);
    ticker.emit(payload.clone()).await.unwrap();

    let got_a = tokio::time::timeout(Duration::from_secs(5), notif_a.recv())
        .await
        .expect("client A timed out")
        .expect("client A channel closed");
    let got_b = tokio::time::timeout(Duration::from_secs(5), notif_b.recv())
        .await
        .expect("client B timed out")
        .expect("client B channel closed");
    assert_eq!(got_a.service, "Ticker");
    assert_eq!(got_a.result, payload);
    assert_eq!(got_b.result, payload);

    // Exactly once each, and nothing for the unlinked client.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(notif_a.try_recv().is_err());
    assert!(notif_b.try_recv().is_err());
    assert!(notif_c.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn notification_order_is_preserved_per_client() {
    let manager = start_default_manager().await;
    let ticker = ServiceBuilder::new("Ticker")
        .serve(options(manager.addr))
        .await
        .unwrap();

    let mut client = Client::connect(options(manager.addr)).await.unwrap();
    client.link("Ticker").await.unwrap();
    let mut notifications = client.notifications().unwrap();

    for i in 0..10 {
        ticker.emit(json!(i)).await.unwrap();
    }
    for i in 0..10 {
        let got = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(got.result, json!(i));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mid_flight_service_death_yields_service_gone() {
    let tmp = tempfile::tempdir().unwrap();
    let database = tmp.path().join("manager.sqlite3");
    {
        let store = Store::open(&database).unwrap();
        store.insert_user("root", "toor", true).unwrap();
    }
    let manager = start_manager(AuthPolicy::Login, database).await;

    let creds = |o: switchboard_peer::ConnectOptions| o.with_login("root", "toor");
    let _slow = ServiceBuilder::new("Slow")
        .attribute("work", "() -> str", |_, _| {
            std::thread::sleep(Duration::from_secs(2));
            Ok(json!("done"))
        })
        .serve(creds(options(manager.addr)))
        .await
        .unwrap();

    let client = Client::connect(creds(options(manager.addr))).await.unwrap();
    client.link("Slow").await.unwrap();
    let admin = Client::connect_as("admin", creds(options(manager.addr)))
        .await
        .unwrap();

    // Find the service's address through the manager identity.
    let identity = admin.manager_request("identity", vec![]).await.unwrap();
    let service_addr = identity["services"]["Slow"]["address"]
        .as_str()
        .expect("service address in the directory")
        .to_string();

    let request = tokio::spawn({
        let pending = client;
        async move {
            let err = pending
                .request_with_uid("Slow", "work", vec![], Map::new(), "u5")
                .await
                .unwrap_err();
            err.to_string()
        }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    admin.kick(&service_addr).await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), request)
        .await
        .expect("request never settled")
        .unwrap();
    assert!(message.contains("service-gone"), "got: {message}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn graceful_shutdown_settles_in_flight_requests() {
    let tmp = tempfile::tempdir().unwrap();
    let database = tmp.path().join("manager.sqlite3");
    {
        let store = Store::open(&database).unwrap();
        store.insert_user("root", "toor", true).unwrap();
    }
    let manager = start_manager(AuthPolicy::Login, database).await;
    let creds = |o: switchboard_peer::ConnectOptions| o.with_login("root", "toor");

    let _service = ServiceBuilder::new("Slow2")
        .attribute("work", "(tag: str) -> str", |args, _| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(args.first().cloned().unwrap_or(Value::Null))
        })
        .serve(creds(options(manager.addr)))
        .await
        .unwrap();

    let client_one = Client::connect_as("one", creds(options(manager.addr)))
        .await
        .unwrap();
    let client_two = Client::connect_as("two", creds(options(manager.addr)))
        .await
        .unwrap();
    let idle = Client::connect_as("idle", creds(options(manager.addr)))
        .await
        .unwrap();
    let admin = Client::connect_as("admin", creds(options(manager.addr)))
        .await
        .unwrap();
    client_one.link("Slow2").await.unwrap();
    client_two.link("Slow2").await.unwrap();

    let first = tokio::spawn(async move {
        client_one
            .request("Slow2", "work", vec![json!("first")], Map::new())
            .await
    });
    let second = tokio::spawn(async move {
        client_two
            .request("Slow2", "work", vec![json!("second")], Map::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    admin.shutdown_manager().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // (a) new requests are rejected while draining.
    let err = idle
        .request("Slow2", "work", vec![json!("late")], Map::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("draining"), "got: {err}");

    // (b) the two pending replies still arrive.
    let first = tokio::time::timeout(Duration::from_secs(10), first)
        .await
        .expect("first request never settled")
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(10), second)
        .await
        .expect("second request never settled")
        .unwrap()
        .unwrap();
    assert_eq!(first, json!("first"));
    assert_eq!(second, json!("second"));

    // (c)+(d) all sockets close and the manager exits.
    let run_result = tokio::time::timeout(Duration::from_secs(10), manager.task)
        .await
        .expect("manager never stopped")
        .unwrap();
    assert!(run_result.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exclusive_lock_blocks_other_links() {
    let manager = start_default_manager().await;
    let _service = echo_service().serve(options(manager.addr)).await.unwrap();

    let holder = Client::connect_as("holder", options(manager.addr)).await.unwrap();
    holder.link("Echo").await.unwrap();
    holder.lock("Echo", "exclusive").await.unwrap();

    let other = Client::connect_as("other", options(manager.addr)).await.unwrap();
    let err = other.link("Echo").await.unwrap_err();
    assert!(err.to_string().contains("exclusive"), "got: {err}");

    holder.unlock("Echo").await.unwrap();
    other.link("Echo").await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_service_name_is_refused() {
    let manager = start_default_manager().await;
    let _first = echo_service().serve(options(manager.addr)).await.unwrap();
    let second = echo_service().serve(options(manager.addr)).await;
    assert!(second.is_err(), "duplicate registration must fail");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn service_exceptions_are_forwarded() {
    let manager = start_default_manager().await;
    let _service = ServiceBuilder::new("Math")
        .attribute("divide", "(a: f64, b: f64) -> f64", |args, _| {
            let a = args[0].as_f64().ok_or("a must be a number")?;
            let b = args[1].as_f64().ok_or("b must be a number")?;
            if b == 0.0 {
                return Err("division by zero".into());
            }
            Ok(json!(a / b))
        })
        .serve(options(manager.addr))
        .await
        .unwrap();

    let client = Client::connect(options(manager.addr)).await.unwrap();
    client.link("Math").await.unwrap();

    let ok = client
        .request("Math", "divide", vec![json!(1.0), json!(4.0)], Map::new())
        .await
        .unwrap();
    assert_eq!(ok, json!(0.25));

    let err = client
        .request("Math", "divide", vec![json!(1.0), json!(0.0)], Map::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("division by zero"), "got: {err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn login_rejects_bad_credentials() {
    let tmp = tempfile::tempdir().unwrap();
    let database = tmp.path().join("manager.sqlite3");
    {
        let store = Store::open(&database).unwrap();
        store.insert_user("alice", "secret", false).unwrap();
    }
    let manager = start_manager(AuthPolicy::Login, database).await;

    let bad = Client::connect(options(manager.addr).with_login("alice", "wrong")).await;
    assert!(bad.is_err(), "wrong password must be rejected");

    let good = Client::connect(options(manager.addr).with_login("alice", "secret")).await;
    assert!(good.is_ok(), "correct password must be accepted");

    // Without admin rights, privileged calls are denied.
    let client = good.unwrap();
    let err = client.shutdown_manager().await.unwrap_err();
    assert!(err.to_string().contains("administrator"), "got: {err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn credential_queries_are_available() {
    let tmp = tempfile::tempdir().unwrap();
    let database = tmp.path().join("manager.sqlite3");
    {
        let store = Store::open(&database).unwrap();
        store.insert_user("alice", "secret", false).unwrap();
    }
    let manager = start_manager(AuthPolicy::None, database).await;
    let client = Client::connect(options(manager.addr)).await.unwrap();

    let registered = client
        .manager_request("users_table.is_user_registered", vec![json!("alice")])
        .await
        .unwrap();
    assert_eq!(registered, json!(true));
    let registered = client
        .manager_request("users_table.is_user_registered", vec![json!("bob")])
        .await
        .unwrap();
    assert_eq!(registered, json!(false));

    let hostnames = client
        .manager_request("hostnames_table.hostnames", vec![])
        .await
        .unwrap();
    assert!(hostnames
        .as_array()
        .unwrap()
        .contains(&json!("localhost")));
}
