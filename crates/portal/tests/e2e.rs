use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use portal::{BindOptions, Context, RpcClient, RpcServerBuilder, ServerOptions};
use portal_pack::{Dtype, Value};

fn scalar(v: i64) -> Value {
    Value::array(Dtype::I64, vec![], v.to_le_bytes().to_vec()).expect("scalar array")
}

fn scalar_value(v: &Value) -> i64 {
    match v {
        Value::Array { data, .. } => i64::from_le_bytes(data.as_ref().try_into().expect("8 byte scalar")),
        other => panic!("expected scalar array, got {other:?}"),
    }
}

#[test]
fn call_and_reply_round_trip() {
    let ctx = Context::builder().build();
    let mut builder =
        RpcServerBuilder::<Value>::bind_socket(ServerOptions { bind_addr: "127.0.0.1:0".parse().unwrap(), ..Default::default() })
            .expect("bind server");
    let addr = builder.local_addr();
    builder.bind("double", BindOptions::default(), |args| match args {
        Value::Array { dtype, shape, data } => {
            let n = i64::from_le_bytes(data.as_ref().try_into().unwrap());
            Value::array(dtype, shape, (n * 2).to_le_bytes().to_vec()).map_err(|e| e.to_string())
        }
        _ => Err("expected scalar".to_string()),
    });
    let server = builder.start();

    let client = RpcClient::<Value>::connect(
        &ctx,
        portal::ClientOptions { host: "127.0.0.1".to_string(), port: addr.port(), ..Default::default() },
    );

    let future = client.call("double", &scalar(21), Duration::from_secs(2)).expect("call");
    let result = future.result(Some(Duration::from_secs(2))).expect("result");
    assert_eq!(scalar_value(&result), 42);

    client.close(Some(Duration::from_millis(500)));
    server.close(Some(Duration::from_secs(1)));
}

#[test]
fn errors_false_keeps_serving_after_a_failed_call() {
    let ctx = Context::builder().build();
    let mut builder = RpcServerBuilder::<Value>::bind_socket(ServerOptions {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        errors: false,
        ..Default::default()
    })
    .expect("bind server");
    let addr = builder.local_addr();
    builder.bind("maybe_fail", BindOptions::default(), |args| match args {
        Value::Array { data, .. } if i64::from_le_bytes(data.as_ref().try_into().unwrap()) < 0 => {
            Err("negative input".to_string())
        }
        other => Ok(other),
    });
    let server = builder.start();

    let client = RpcClient::<Value>::connect(
        &ctx,
        portal::ClientOptions { host: "127.0.0.1".to_string(), port: addr.port(), ..Default::default() },
    );

    let failing = client.call("maybe_fail", &scalar(-1), Duration::from_secs(2)).expect("call");
    assert!(failing.result(Some(Duration::from_secs(2))).is_err());

    let healthy = client.call("maybe_fail", &scalar(5), Duration::from_secs(2)).expect("call");
    let result = healthy.result(Some(Duration::from_secs(2))).expect("server kept serving");
    assert_eq!(scalar_value(&result), 5);

    client.close(Some(Duration::from_millis(500)));
    server.close(Some(Duration::from_secs(1)));
}

#[test]
fn post_hook_runs_in_submission_order() {
    let ctx = Context::builder().build();
    let mut builder =
        RpcServerBuilder::<Value>::bind_socket(ServerOptions { bind_addr: "127.0.0.1:0".parse().unwrap(), workers: 4, ..Default::default() })
            .expect("bind server");
    let addr = builder.local_addr();

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let post_order = order.clone();
    builder.bind_with_post(
        "tag",
        BindOptions::default(),
        |args| match &args {
            Value::Array { data, .. } => {
                let n = i64::from_le_bytes(data.as_ref().try_into().unwrap());
                // Later-submitted calls with smaller delays finish their
                // work_fn first, but post_fn must still run in submission order.
                std::thread::sleep(Duration::from_millis((5 - n.min(5)) as u64 * 5));
                Ok((args.clone(), scalar(n)))
            }
            _ => Err("expected scalar".to_string()),
        },
        move |post_info| {
            post_order.lock().unwrap().push(scalar_value(&post_info));
            Ok(())
        },
    );
    let server = builder.start();

    let client = RpcClient::<Value>::connect(
        &ctx,
        portal::ClientOptions { host: "127.0.0.1".to_string(), port: addr.port(), max_inflight: 8, ..Default::default() },
    );

    let futures: Vec<_> =
        (0..5).map(|i| client.call("tag", &scalar(i), Duration::from_secs(2)).expect("call")).collect();
    for future in &futures {
        future.result(Some(Duration::from_secs(2))).expect("result");
    }

    // Give the single post-hook worker a moment to drain.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);

    client.close(Some(Duration::from_millis(500)));
    server.close(Some(Duration::from_secs(1)));
}

#[test]
fn admission_blocks_beyond_max_inflight() {
    let ctx = Context::builder().build();
    let mut builder = RpcServerBuilder::<Value>::bind_socket(ServerOptions {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        workers: 1,
        ..Default::default()
    })
    .expect("bind server");
    let addr = builder.local_addr();
    let in_flight = Arc::new(AtomicU64::new(0));
    let max_seen = Arc::new(AtomicU64::new(0));
    let in_flight_fn = in_flight.clone();
    let max_seen_fn = max_seen.clone();
    builder.bind("slow_echo", BindOptions { workers: Some(2) }, move |args| {
        let now = in_flight_fn.fetch_add(1, Ordering::SeqCst) + 1;
        max_seen_fn.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        in_flight_fn.fetch_sub(1, Ordering::SeqCst);
        Ok(args)
    });
    let server = builder.start();

    let client = RpcClient::<Value>::connect(
        &ctx,
        portal::ClientOptions {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
            max_inflight: 2,
            ..Default::default()
        },
    );

    let futures: Vec<_> =
        (0..6).map(|i| client.call("slow_echo", &scalar(i), Duration::from_secs(5)).expect("call")).collect();
    for future in &futures {
        future.result(Some(Duration::from_secs(5))).expect("result");
    }

    assert!(max_seen.load(Ordering::SeqCst) <= 2, "client-side admission should cap concurrent in-flight calls");

    client.close(Some(Duration::from_millis(500)));
    server.close(Some(Duration::from_secs(1)));
}

#[test]
fn client_stats_track_send_and_recv_counts() {
    let ctx = Context::builder().build();
    let mut builder =
        RpcServerBuilder::<Value>::bind_socket(ServerOptions { bind_addr: "127.0.0.1:0".parse().unwrap(), ..Default::default() })
            .expect("bind server");
    let addr = builder.local_addr();
    builder.bind("double", BindOptions::default(), |args| match args {
        Value::Array { dtype, shape, data } => {
            let n = i64::from_le_bytes(data.as_ref().try_into().unwrap());
            Value::array(dtype, shape, (n * 2).to_le_bytes().to_vec()).map_err(|e| e.to_string())
        }
        _ => Err("expected scalar".to_string()),
    });
    let server = builder.start();

    let client = RpcClient::<Value>::connect(
        &ctx,
        portal::ClientOptions { host: "127.0.0.1".to_string(), port: addr.port(), ..Default::default() },
    );

    let future = client.call("double", &scalar(21), Duration::from_secs(2)).expect("call");
    future.result(Some(Duration::from_secs(2))).expect("result");

    let stats = client.stats();
    assert_eq!(stats.numsend, 1);
    assert_eq!(stats.numrecv, 1);

    client.close(Some(Duration::from_millis(500)));
    server.close(Some(Duration::from_secs(1)));
}

#[test]
fn dropped_future_surfaces_its_error_on_the_next_call() {
    let ctx = Context::builder().build();
    let mut builder =
        RpcServerBuilder::<Value>::bind_socket(ServerOptions { bind_addr: "127.0.0.1:0".parse().unwrap(), ..Default::default() })
            .expect("bind server");
    let addr = builder.local_addr();
    builder.bind("always_fails", BindOptions::default(), |_args| Err("boom".to_string()));
    let server = builder.start();

    let client = RpcClient::<Value>::connect(
        &ctx,
        portal::ClientOptions { host: "127.0.0.1".to_string(), port: addr.port(), ..Default::default() },
    );

    {
        let future = client.call("always_fails", &scalar(1), Duration::from_secs(2)).expect("call");
        assert!(future.wait(Some(Duration::from_secs(2))));
        // Dropped without calling `result()`: the error is abandoned.
    }

    // Give the dropped future's failure a moment to land in the abandoned deque.
    std::thread::sleep(Duration::from_millis(50));

    let next = client.call("always_fails", &scalar(2), Duration::from_secs(2));
    assert!(next.is_err(), "next call should surface the previously abandoned error");

    client.close(Some(Duration::from_millis(500)));
    server.close(Some(Duration::from_secs(1)));
}
