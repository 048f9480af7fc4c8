//! Benchmarks for strata core operations.
//!
//! Run with: cargo bench
//!
//! Results include 95% confidence intervals via Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use strata::audit::hasher;
use strata::components::vpc::{vpc, VpcArgs};
use strata::core::evaluator::Evaluator;
use strata::core::graph::ResourceGraph;
use strata::core::parser;
use strata::core::resolver;
use strata::core::synth::{synthesize, SynthOptions};
use strata::providers::Registry;

const ZONES: [&str; 6] = [
    "us-east-1a",
    "us-east-1b",
    "us-east-1c",
    "us-east-1d",
    "us-east-1e",
    "us-east-1f",
];

fn bench_blake3_string(c: &mut Criterion) {
    let mut group = c.benchmark_group("blake3_string");
    for size in [64, 256, 1024, 4096] {
        let input: String = "x".repeat(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &input, |b, input| {
            b.iter(|| black_box(hasher::hash_string(black_box(input))));
        });
    }
    group.finish();
}

fn bench_namespace_parse(c: &mut Criterion) {
    let yaml = r#"
version: "1.0"
namespace: bench
tags: { team: platform, env: bench }
params:
  cidr: 10.0.0.0/16
templates:
  network:
    declare:
      - component: vpc
        name: core
        inputs:
          cidr_block: "{{params.cidr}}"
          availability_zones: [us-east-1a, us-east-1b, us-east-1c]
  app:
    declare:
      - resource: aws_security_group
        name: web
        attributes:
          name: web
          vpc_id: "${aws_vpc.core.id}"
          ingress:
            - { protocol: tcp, from_port: 443, to_port: 443, cidr_blocks: [0.0.0.0/0] }
      - resource: aws_instance
        name: web
        attributes:
          ami: ami-123
          instance_type: t3.micro
          subnet_id: "${aws_subnet.core_private_0.id}"
          vpc_security_group_ids: ["${aws_security_group.web.id}"]
      - resource: aws_s3_bucket
        name: logs
        attributes: { bucket: strata-bench-logs }
"#;

    c.bench_function("namespace_parse_validate", |b| {
        b.iter(|| {
            let config = parser::parse_namespace(black_box(yaml)).unwrap();
            black_box(parser::validate_namespace(&config));
        });
    });
}

fn network_graph(zones: usize) -> ResourceGraph {
    let reg = Registry::builtin();
    let mut ev = Evaluator::new(&reg);
    ev.set_template("network");
    vpc(&mut ev, "core", &VpcArgs::new("10.0.0.0/16", &ZONES[..zones])).unwrap();
    ev.into_graph()
}

fn bench_vpc_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("vpc_evaluate");
    for zones in [2, 4, 6] {
        group.bench_with_input(BenchmarkId::from_parameter(zones), &zones, |b, &zones| {
            b.iter(|| black_box(network_graph(zones)));
        });
    }
    group.finish();
}

fn bench_synthesize(c: &mut Criterion) {
    let mut group = c.benchmark_group("synthesize");
    let opts = SynthOptions::default();
    for zones in [2, 6] {
        let graph = network_graph(zones);
        group.bench_with_input(BenchmarkId::from_parameter(zones), &graph, |b, graph| {
            b.iter(|| {
                let ir = synthesize(black_box(graph), "network", &opts).unwrap();
                black_box(ir.fingerprint());
            });
        });
    }
    group.finish();
}

fn bench_template_order(c: &mut Criterion) {
    // A chain of N templates, each VPC's gateway living one template later
    let mut group = c.benchmark_group("template_order");
    for n in [10, 50, 100] {
        let reg = Registry::builtin();
        let mut ev = Evaluator::new(&reg);
        let mut templates = Vec::with_capacity(n);
        for i in 0..n {
            let template = format!("t{i:04}");
            ev.set_template(template.as_str());
            ev.declare(
                "aws_vpc",
                &format!("v{i}"),
                strata::attrs! { "cidr_block" => "10.0.0.0/16" },
            )
            .unwrap();
            if i > 0 {
                let prev = ev.reference("aws_vpc", &format!("v{}", i - 1)).unwrap();
                ev.declare(
                    "aws_internet_gateway",
                    &format!("gw{i}"),
                    strata::attrs! { "vpc_id" => prev.id() },
                )
                .unwrap();
            }
            templates.push(template);
        }
        let graph = ev.into_graph();
        group.bench_with_input(BenchmarkId::from_parameter(n), &graph, |b, graph| {
            b.iter(|| black_box(resolver::template_order(graph, &templates).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_blake3_string,
    bench_namespace_parse,
    bench_vpc_evaluate,
    bench_synthesize,
    bench_template_order
);
criterion_main!(benches);
