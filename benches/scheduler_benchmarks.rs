//! Performance benchmarks for the toykit event loop
//!
//! These benchmarks cover the hot paths of an iteration: draining deferred
//! work, coalescing redraw requests and streaming offer data.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use toykit::config::WindowConfig;
use toykit::{Cursor, Scheduler, ShmBackend, SurfaceId, Window};

/// Benchmark draining a deferred queue of different lengths
fn bench_deferred_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("deferred_drain");

    for task_count in [10, 100, 1000, 10_000].iter() {
        group.bench_with_input(
            format!("drain_{}_tasks", task_count),
            task_count,
            |b, &task_count| {
                b.iter_batched(
                    || {
                        let scheduler = Scheduler::new().unwrap();
                        let handle = scheduler.handle();
                        let counter = Rc::new(Cell::new(0usize));
                        for _ in 0..task_count {
                            let counter = Rc::clone(&counter);
                            handle.defer(move || counter.set(counter.get() + 1));
                        }
                        (scheduler, counter)
                    },
                    |(mut scheduler, counter)| {
                        scheduler.dispatch(Some(Duration::ZERO)).unwrap();
                        black_box(counter.get());
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

/// Benchmark redraw requests collapsing into one painted frame
fn bench_redraw_coalescing(c: &mut Criterion) {
    let mut group = c.benchmark_group("redraw_coalescing");

    for requests in [1, 16, 256].iter() {
        group.bench_with_input(
            format!("{}_requests_per_frame", requests),
            requests,
            |b, &requests| {
                let mut scheduler = Scheduler::new().unwrap();
                let window = Window::new(
                    &scheduler.handle(),
                    ShmBackend::new(),
                    &WindowConfig::default(),
                );
                window.set_frame_callbacks(SurfaceId::MAIN, false);
                window.set_painter(SurfaceId::MAIN, |ctx| ctx.drawable().fill(0xff00_0000));
                window.schedule_resize(256, 256);
                scheduler.dispatch(Some(Duration::ZERO)).unwrap();

                b.iter(|| {
                    for _ in 0..requests {
                        window.schedule_redraw();
                    }
                    scheduler.dispatch(Some(Duration::ZERO)).unwrap();
                });
            },
        );
    }

    group.finish();
}

/// Benchmark animated cursor frame selection
fn bench_cursor_frames(c: &mut Criterion) {
    let cursor = Cursor::new((1..=24).map(|i| 20 + i * 5).collect());

    c.bench_function("cursor_frame_selection", |b| {
        let mut elapsed = 0u32;
        b.iter(|| {
            elapsed = elapsed.wrapping_add(7);
            black_box(cursor.frame_and_duration(black_box(elapsed)))
        });
    });
}

criterion_group!(
    benches,
    bench_deferred_drain,
    bench_redraw_coalescing,
    bench_cursor_frames
);
criterion_main!(benches);
