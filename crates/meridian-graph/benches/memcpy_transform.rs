//! Benchmarks for provider boundary rewriting
//!
//! Builds layered graphs where every other layer runs on the device, so each
//! layer boundary needs a memcpy node.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use meridian_core::{CPU_EXECUTION_PROVIDER, DEVICE_EXECUTION_PROVIDER};
use meridian_graph::{Graph, TransformerMemcpy};

fn layered_graph(layers: usize, width: usize) -> Graph {
    let mut graph = Graph::new();
    graph.set_inputs(&["in"]);

    let mut previous: Vec<String> = vec!["in".to_string(); width];
    for layer in 0..layers {
        let provider = if layer % 2 == 0 {
            CPU_EXECUTION_PROVIDER
        } else {
            DEVICE_EXECUTION_PROVIDER
        };
        let mut current = Vec::with_capacity(width);
        for lane in 0..width {
            let output = format!("l{layer}_{lane}");
            let node = graph
                .add_node(&format!("n{layer}_{lane}"), "Relu", &[previous[lane].as_str()], &[output.as_str()])
                .expect("unique names");
            graph.assign_provider(node, provider).expect("node exists");
            current.push(output);
        }
        previous = current;
    }

    let outputs: Vec<&str> = previous.iter().map(String::as_str).collect();
    graph.set_outputs(&outputs);
    graph
}

fn bench_rewrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("memcpy_transform");
    let transformer = TransformerMemcpy::new(DEVICE_EXECUTION_PROVIDER);

    for (layers, width) in [(8, 8), (32, 16), (64, 64)] {
        let nodes = layers * width;
        group.bench_with_input(BenchmarkId::new("first_pass", nodes), &(layers, width), |b, &(l, w)| {
            b.iter_batched(
                || layered_graph(l, w),
                |mut graph| black_box(transformer.run(&mut graph)),
                BatchSize::SmallInput,
            );
        });

        group.bench_with_input(BenchmarkId::new("idempotent_pass", nodes), &(layers, width), |b, &(l, w)| {
            let mut graph = layered_graph(l, w);
            transformer.run(&mut graph).expect("valid graph");
            b.iter(|| black_box(transformer.run(&mut graph)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_rewrite);
criterion_main!(benches);
