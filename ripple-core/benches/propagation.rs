//! Propagation benchmarks
//!
//! Measures priming and firing over a chain and a wide fan-out, the two
//! shapes that stress the fire path walk the most.

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use ripple_core::{compute_fn, Graph, Node, Source};

fn chain(length: usize) -> (Graph, Source<u64>, Node<u64>) {
    let graph = Graph::new();
    let source = graph.source_with("source", 0u64).unwrap();
    let mut tail = source.node().clone();
    for i in 0..length {
        let previous = tail.clone();
        tail = graph
            .add(format!("link {i}"), move |w| {
                let dep = w.depend_on(&previous)?;
                Ok(compute_fn(move |_| Ok(dep.output()?.map(|v| v + 1))))
            })
            .unwrap();
    }
    (graph, source, tail)
}

fn fan_out(width: usize) -> (Graph, Source<u64>, Source<u64>) {
    let graph = Graph::new();
    let hot = graph.source_with("hot", 0u64).unwrap();
    let cold = graph.source_with("cold", 0u64).unwrap();
    for i in 0..width {
        let from = if i % 2 == 0 { hot.clone() } else { cold.clone() };
        graph
            .add(format!("leaf {i}"), move |w| {
                let dep = w.depend_on(&from)?;
                Ok(compute_fn(move |_| Ok(dep.output()?.map(|v| v * 2))))
            })
            .unwrap();
    }
    (graph, hot, cold)
}

fn benchmark_prime(c: &mut Criterion) {
    let mut group = c.benchmark_group("prime");

    for length in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*length as u64));
        group.bench_with_input(BenchmarkId::from_parameter(length), length, |b, &length| {
            b.iter_batched(
                || chain(length).0,
                |graph| {
                    graph.prime().unwrap();
                    black_box(graph)
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn benchmark_fire_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("fire_chain");

    for length in [10, 100, 1000].iter() {
        let (graph, source, tail) = chain(*length);
        graph.prime().unwrap();
        let mut value = 0u64;

        group.throughput(Throughput::Elements(*length as u64));
        group.bench_with_input(BenchmarkId::from_parameter(length), length, |b, _| {
            b.iter(|| {
                value += 1;
                source.fire(black_box(value)).unwrap();
                black_box(tail.output().unwrap())
            });
        });
    }

    group.finish();
}

fn benchmark_fire_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fire_fan_out");

    for width in [10, 100, 1000].iter() {
        let (graph, hot, cold) = fan_out(*width);
        graph.prime().unwrap();

        group.bench_with_input(BenchmarkId::new("single", width), width, |b, _| {
            b.iter(|| hot.fire(black_box(1)).unwrap());
        });

        group.bench_with_input(BenchmarkId::new("batch", width), width, |b, _| {
            b.iter(|| {
                graph
                    .batch(|| {
                        hot.fire(black_box(2))?;
                        cold.fire(black_box(3))
                    })
                    .unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_prime,
    benchmark_fire_chain,
    benchmark_fire_fan_out
);
criterion_main!(benches);
