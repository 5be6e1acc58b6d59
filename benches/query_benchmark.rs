//! Benchmarks for k2filter request matching.
//!
//! Run with: cargo bench
//!
//! This benchmark suite measures:
//! - Request matching throughput with and without the decision cache
//! - Scalability with different rule set sizes
//! - Index build and swap cost
//! - Exception list lookups

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use k2filter::exceptions::ExceptionLists;
use k2filter::index::{
    combined_checksum, sha256_hex, DomainIndexBuilder, IndexBytes, IndexHandle, RuleBuffer,
    RuleIndexBuilder,
};
use k2filter::{ExceptionsList, ResourceKind, SourceId};
use url::Url;

/// Generate a rule buffer with `count` domain rules.
fn generate_buffer(count: usize) -> RuleBuffer {
    let mut rules = String::with_capacity(count * 32);
    for i in 0..count {
        match i % 4 {
            0 => rules.push_str(&format!("||ads{}.example.com^\n", i)),
            1 => rules.push_str(&format!("||track{}.example.net^$third-party\n", i)),
            2 => rules.push_str(&format!("||scam{}.example^$document\n", i)),
            _ => rules.push_str(&format!("@@||cdn{}.example.org^\n", i)),
        }
    }
    RuleBuffer {
        source_id: SourceId(1),
        checksum: sha256_hex(rules.as_bytes()),
        rules: Arc::from(rules),
    }
}

fn build_handle(count: usize, cache_capacity: usize) -> IndexHandle {
    let buffers = vec![generate_buffer(count)];
    let checksum = combined_checksum(&buffers);
    let builder = DomainIndexBuilder;
    let data = builder.build(&checksum, &buffers).unwrap();
    let index = builder.load(IndexBytes::Owned(data), &checksum).unwrap();
    let handle = IndexHandle::new(cache_capacity);
    handle.store(Some(index));
    handle
}

/// Generate request URLs, a share of which hit a rule.
fn generate_requests(count: usize, hit_ratio: f64) -> Vec<Url> {
    let hits = (count as f64 * hit_ratio) as usize;
    (0..count)
        .map(|i| {
            let host = if i < hits {
                format!("img.ads{}.example.com", (i % 1000) * 4)
            } else {
                format!("static{}.unknown.org", i)
            };
            Url::parse(&format!("https://{}/asset.js", host)).unwrap()
        })
        .collect()
}

fn page() -> Url {
    Url::parse("https://news.example.org/article").unwrap()
}

/// Benchmark request matching without cache.
fn bench_request_no_cache(c: &mut Criterion) {
    let handle = build_handle(20_000, 0);
    let requests = generate_requests(1000, 0.8);
    let page = page();

    let mut group = c.benchmark_group("request_no_cache");
    group.throughput(Throughput::Elements(requests.len() as u64));

    group.bench_function("mixed_requests", |b| {
        b.iter(|| {
            for url in &requests {
                black_box(handle.find_request_match(url, Some(&page), ResourceKind::Script));
            }
        })
    });

    group.finish();
}

/// Benchmark request matching with a warm decision cache.
fn bench_request_with_cache(c: &mut Criterion) {
    let handle = build_handle(20_000, 10_000);
    let requests = generate_requests(1000, 0.8);
    let page = page();

    for url in &requests {
        let _ = handle.find_request_match(url, Some(&page), ResourceKind::Script);
    }

    let mut group = c.benchmark_group("request_with_cache");
    group.throughput(Throughput::Elements(requests.len() as u64));

    group.bench_function("cache_hit", |b| {
        b.iter(|| {
            for url in &requests {
                black_box(handle.find_request_match(url, Some(&page), ResourceKind::Script));
            }
        })
    });

    group.bench_function("single_miss", |b| {
        let url = &requests[0];
        b.iter_batched(
            || handle.clear_cache(),
            |_| black_box(handle.find_request_match(url, Some(&page), ResourceKind::Script)),
            criterion::BatchSize::SmallInput,
        )
    });

    group.finish();
}

/// Benchmark scalability with different rule set sizes.
fn bench_scalability(c: &mut Criterion) {
    let mut group = c.benchmark_group("scalability");
    let page = page();

    for size in [1_000, 10_000, 100_000].iter() {
        let handle = build_handle(*size, 0);
        let requests = generate_requests(100, 0.5);

        group.throughput(Throughput::Elements(requests.len() as u64));
        group.bench_with_input(BenchmarkId::new("rules", size), size, |b, _| {
            b.iter(|| {
                for url in &requests {
                    black_box(handle.find_request_match(url, Some(&page), ResourceKind::Image));
                }
            })
        });
    }

    group.finish();
}

/// Benchmark building an index and swapping it in.
fn bench_rebuild(c: &mut Criterion) {
    let buffers = vec![generate_buffer(20_000)];
    let checksum = combined_checksum(&buffers);
    let builder = DomainIndexBuilder;
    let handle = IndexHandle::new(10_000);

    let mut group = c.benchmark_group("rebuild");

    group.bench_function("build_20k_rules", |b| {
        b.iter(|| black_box(builder.build(&checksum, &buffers).unwrap()))
    });

    let data = builder.build(&checksum, &buffers).unwrap();
    group.bench_function("load_and_swap", |b| {
        b.iter_batched(
            || data.clone(),
            |data| {
                let index = builder.load(IndexBytes::Owned(data), &checksum).unwrap();
                handle.store(Some(index));
            },
            criterion::BatchSize::SmallInput,
        )
    });

    group.finish();
}

/// Benchmark exception list lookups.
fn bench_exemption(c: &mut Criterion) {
    let mut lists = ExceptionLists::new();
    for i in 0..1_000 {
        lists.add_domain(ExceptionsList::ExemptList, &format!("site{}.example.com", i));
    }
    let listed = Url::parse("https://a.b.site500.example.com/").unwrap();
    let unlisted = Url::parse("https://a.b.other.example.com/").unwrap();

    let mut group = c.benchmark_group("exemption");

    group.bench_function("listed_subdomain", |b| {
        b.iter(|| black_box(lists.is_exempt(Some(&listed))))
    });

    group.bench_function("unlisted", |b| {
        b.iter(|| black_box(lists.is_exempt(Some(&unlisted))))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_request_no_cache,
    bench_request_with_cache,
    bench_scalability,
    bench_rebuild,
    bench_exemption,
);

criterion_main!(benches);
