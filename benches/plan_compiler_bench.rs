use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;

use query_dispatcher::config::demo_registry;
use query_dispatcher::{
    normalize, reduce, AggFunc, ConditionTree, FieldDescriptor, FilterContext, QueryCompiler,
    SchemaCache,
};

fn create_cache() -> SchemaCache {
    SchemaCache::new(Box::new(demo_registry()))
}

fn filter_cases() -> Vec<(&'static str, &'static str)> {
    vec![
        ("simple", "active=true"),
        ("medium", "active=true&(name=ann|email=ann@example.com)"),
        (
            "complex",
            "~(labels=vip,beta)&(orders__state=paid|orders__total__gte=100)&$search=acme",
        ),
    ]
}

// 基准测试：Filter解析性能
fn benchmark_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_performance");

    for (name, filter) in filter_cases() {
        group.bench_with_input(BenchmarkId::new("parse", name), &filter, |b, &filter| {
            b.iter(|| {
                let tree = ConditionTree::parse(black_box(filter)).expect("解析应该成功");
                black_box(tree)
            })
        });
    }

    group.finish();
}

// 基准测试：结构哈希计算
fn benchmark_hashing(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_performance");

    for (name, filter) in filter_cases() {
        let tree = ConditionTree::parse(filter).expect("解析应该成功");
        group.bench_with_input(BenchmarkId::new("root_hash", name), &tree, |b, tree| {
            b.iter(|| black_box(tree.root_hash()))
        });
    }

    group.finish();
}

// 基准测试：描述符规范化与合并
fn benchmark_descriptor_reduce(c: &mut Criterion) {
    let forest = vec![
        FieldDescriptor::related("customer.company"),
        FieldDescriptor::json("orders", vec!["id".to_string(), "total".to_string()]),
        FieldDescriptor::json("orders", vec!["id".to_string(), "state".to_string()]),
        FieldDescriptor::aggregate("orders__total", AggFunc::Sum).with_alias("orders_total"),
        FieldDescriptor::exists("orders").with_alias("has_orders"),
    ];

    let mut group = c.benchmark_group("descriptor_reduce");

    group.bench_with_input(
        BenchmarkId::new("normalize_reduce", "mixed_forest"),
        &forest,
        |b, forest| {
            b.iter(|| {
                let reduced =
                    reduce(normalize(black_box(forest.clone()))).expect("合并应该成功");
                black_box(reduced)
            })
        },
    );

    group.finish();
}

// 基准测试：查询计划编译
fn benchmark_compile(c: &mut Criterion) {
    let cache = create_cache();
    let compiler = QueryCompiler::new(&cache);
    let context = FilterContext::new();

    let mut group = c.benchmark_group("compile_performance");

    for (name, filter) in filter_cases() {
        let tree = ConditionTree::parse(filter).expect("解析应该成功");
        group.bench_with_input(BenchmarkId::new("compile", name), &tree, |b, tree| {
            b.iter(|| {
                let plan = compiler
                    .compile("customers", black_box(tree), &[], &context)
                    .expect("编译应该成功");
                black_box(plan)
            })
        });
    }

    group.finish();
}

// 基准测试：完整的端到端处理
fn benchmark_end_to_end(c: &mut Criterion) {
    let cache = create_cache();
    let compiler = QueryCompiler::new(&cache);
    let context = FilterContext::new();

    let descriptors = vec![
        FieldDescriptor::json("orders", vec!["id".to_string(), "total".to_string()])
            .with_order_by(vec!["-total".to_string()])
            .with_slice(0..5),
        FieldDescriptor::aggregate("orders__total", AggFunc::Sum).with_alias("orders_total"),
        FieldDescriptor::exists("orders").with_alias("has_orders"),
    ];

    let mut group = c.benchmark_group("end_to_end_performance");

    for (name, filter) in filter_cases() {
        group.bench_with_input(
            BenchmarkId::new("full_pipeline", name),
            &filter,
            |b, &filter| {
                b.iter(|| {
                    let tree = ConditionTree::parse(black_box(filter)).expect("解析应该成功");
                    let plan = compiler
                        .compile("customers", &tree, black_box(&descriptors), &context)
                        .expect("编译应该成功");
                    black_box(plan.to_sql())
                })
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_parse,
    benchmark_hashing,
    benchmark_descriptor_reduce,
    benchmark_compile,
    benchmark_end_to_end
);
criterion_main!(benches);
