//! Flood control and channel queue benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;
use twirc_client::{ChannelQueue, DecayingWindow, Message};

fn joined_queue(flood_window: Duration, flood_max: usize) -> ChannelQueue {
    let queue = ChannelQueue::new("#bench", 1000, flood_window, flood_max);
    queue.on_inbound_message(&Message::parse(":tmi 353 bot = #bench :bot"));
    queue.on_inbound_message(&Message::parse(":tmi 366 bot #bench :End of /NAMES list"));
    queue
}

fn bench_window_increment(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_increment");

    for groups in [1, 16, 256] {
        let names: Vec<String> = (0..groups).map(|i| format!("#chan{i}")).collect();

        group.bench_with_input(BenchmarkId::from_parameter(groups), &names, |b, names| {
            let mut window = DecayingWindow::new(Duration::from_millis(1));
            let mut idx = 0;
            b.iter(|| {
                idx = (idx + 1) % names.len();
                black_box(window.increment(&names[idx]))
            });
        });
    }

    group.finish();
}

fn bench_window_at_cap(c: &mut Criterion) {
    let mut window = DecayingWindow::new(Duration::from_secs(30));
    for _ in 0..20 {
        window.increment_if_under("#full", 20);
    }

    c.bench_function("window_rejected_at_cap", |b| {
        b.iter(|| black_box(window.increment_if_under("#full", 20)));
    });
}

fn bench_enqueue_dequeue(c: &mut Criterion) {
    let queue = joined_queue(Duration::from_millis(1), usize::MAX);
    let message = Message::parse("PRIVMSG #bench :hello chat");

    c.bench_function("queue_enqueue_dequeue", |b| {
        b.iter(|| {
            queue.enqueue(message.clone());
            black_box(queue.dequeue_next())
        });
    });
}

fn bench_enqueue_flood_dropped(c: &mut Criterion) {
    let queue = joined_queue(Duration::from_secs(30), 20);
    let message = Message::parse("PRIVMSG #bench :spam");
    for _ in 0..20 {
        queue.enqueue(message.clone());
    }

    c.bench_function("queue_enqueue_flood_dropped", |b| {
        b.iter(|| black_box(queue.try_enqueue(message.clone())));
    });
}

criterion_group!(
    benches,
    bench_window_increment,
    bench_window_at_cap,
    bench_enqueue_dequeue,
    bench_enqueue_flood_dropped,
);
criterion_main!(benches);
