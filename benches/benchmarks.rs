use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use triplebuf::TripleBuffer;

pub fn benchmark(c: &mut Criterion) {
    let (mut producer, mut consumer) = TripleBuffer::new_with_front(0u8).split();
    {
        let mut uncontended = c.benchmark_group("uncontended");
        uncontended.bench_function("clean read", |b| {
            b.iter(|| black_box(consumer.read().1))
        });
        uncontended.bench_function("write", |b| b.iter(|| producer.write(black_box(0))));
        uncontended.bench_function("write and commit", |b| {
            b.iter(|| {
                producer.write(black_box(0));
                producer.commit()
            })
        });
        uncontended.bench_function("write, commit and dirty read", |b| {
            b.iter(|| {
                producer.write(black_box(0));
                producer.commit().unwrap();
                black_box(consumer.read().1)
            })
        });
    }
    {
        let mut read_contended = c.benchmark_group("read contention");
        testbench::run_under_contention(
            || black_box(consumer.read().1),
            || {
                read_contended.bench_function("write and commit", |b| {
                    b.iter(|| {
                        producer.write(black_box(0));
                        producer.commit()
                    })
                });
            },
        );
    }
    {
        let mut write_contended = c.benchmark_group("write contention");
        testbench::run_under_contention(
            || {
                producer.write(black_box(0));
                producer.commit()
            },
            || {
                write_contended.bench_function("read", |b| {
                    b.iter(|| black_box(consumer.read().1))
                });
                write_contended.bench_function("has_pending", |b| {
                    b.iter(|| black_box(consumer.has_pending()))
                });
            },
        );
    }
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
