use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::{StreamExt, stream::FuturesUnordered};
use potassium::{
    Potassium, PotassiumStatus, RequestId, Response, ServeConfig, StatusEvent,
    mailbox::{Deposit, Mailbox, MailboxKey, ResponseHead},
};
use std::time::{Duration, Instant};
use tokio::runtime::Builder;

const EVENTS: usize = 1_000;

fn bench_status_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("status/update");
    group.throughput(Throughput::Elements(EVENTS as u64));

    let ids: Vec<RequestId> = (0..EVENTS).map(|_| RequestId::generate()).collect();
    group.bench_function("received/start/end", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            for _ in 0..iters {
                let now = Instant::now();
                let mut status = PotassiumStatus::initial(4, now);
                for _ in 0..4 {
                    status = status.update(&StatusEvent::WorkerStarted, now);
                }
                for id in &ids {
                    status = status.update(&StatusEvent::RequestReceived, now);
                    status = status.update(&StatusEvent::InferenceStart(id.clone()), now);
                    status = status.update(&StatusEvent::InferenceEnd(id.clone()), now);
                }
                black_box(status.view(now));
            }
            start.elapsed()
        });
    });
    group.finish();
}

fn bench_mailbox(c: &mut Criterion) {
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();
    let mut group = c.benchmark_group("mailbox");
    group.throughput(Throughput::Elements(EVENTS as u64));

    group.bench_function("put_then_take", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let mailbox = Mailbox::new(Duration::from_secs(1));
            let start = Instant::now();
            for _ in 0..iters {
                for _ in 0..EVENTS {
                    let id = RequestId::generate();
                    mailbox.put(
                        MailboxKey::Response(id.clone()),
                        Deposit::Head(ResponseHead {
                            status: StatusCode::OK,
                            headers: HeaderMap::new(),
                            body: Bytes::from_static(b"{}"),
                            streaming: false,
                        }),
                    );
                    black_box(mailbox.take(&id).await.unwrap());
                }
            }
            start.elapsed()
        });
    });
    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();
    let concurrency_cases = [1, 4, 16];

    for &num_workers in &[1_usize, 4] {
        let dispatcher = rt.block_on(async {
            Potassium::new("bench")
                .handler("/", |_, req| {
                    Response::json(StatusCode::OK, &serde_json::json!({ "echo": req.json() }))
                })
                .unwrap()
                .start(ServeConfig::default().with_num_workers(num_workers))
                .await
                .unwrap()
        });

        for &concurrency in &concurrency_cases {
            let mut group = c.benchmark_group("dispatch/json");
            group.throughput(Throughput::Elements(concurrency as u64));
            group.bench_function(
                format!("workers/{num_workers}/conc/{concurrency}"),
                |b| {
                    b.to_async(&rt).iter_custom(|iters| {
                        let dispatcher = dispatcher.clone();
                        async move {
                            let start = Instant::now();
                            for _ in 0..iters {
                                let mut calls: FuturesUnordered<_> = (0..concurrency)
                                    .map(|_| {
                                        dispatcher.dispatch(
                                            "/",
                                            HeaderMap::new(),
                                            Bytes::from_static(br#"{"x": 1}"#),
                                        )
                                    })
                                    .collect();
                                while let Some(response) = calls.next().await {
                                    assert_eq!(response.status, StatusCode::OK);
                                }
                            }
                            start.elapsed()
                        }
                    });
                },
            );
            group.finish();
        }

        rt.block_on(dispatcher.shutdown()).unwrap();
    }
}

criterion_group!(benches, bench_status_update, bench_mailbox, bench_dispatch);
criterion_main!(benches);
