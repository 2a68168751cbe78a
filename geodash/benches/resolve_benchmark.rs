use criterion::{criterion_group, criterion_main, Criterion};
use geodash::{GeoDash, GeoDashConfig, PlaceId, PlaceRecord, QueryRequest};

const SYLLABLES: &[&str] = &[
    "lon", "par", "ber", "man", "ches", "ter", "ville", "burg", "sp", "ring", "field", "san",
    "to", "ri", "no", "ka", "mi", "do", "sa", "lem",
];
const COUNTRIES: &[&str] = &["GB", "FR", "US", "DE", "BR", "IT", "ES", "CA"];

/// Deterministic synthetic gazetteer
fn synthetic_places(n: usize) -> Vec<PlaceRecord> {
    (0..n)
        .map(|i| {
            let a = SYLLABLES[i % SYLLABLES.len()];
            let b = SYLLABLES[(i / SYLLABLES.len()) % SYLLABLES.len()];
            let c = SYLLABLES[(i / 400) % SYLLABLES.len()];
            let mut name = format!("{a}{b}{c}");
            name[..1].make_ascii_uppercase();
            PlaceRecord {
                id: PlaceId(i as i64 + 1),
                ascii_name: name.clone(),
                name,
                country_code: COUNTRIES[i % COUNTRIES.len()].to_string(),
                country_name: None,
                state_code: None,
                state_name: None,
                latitude: ((i * 37) % 170) as f64 - 85.0,
                longitude: ((i * 91) % 350) as f64 - 175.0,
                population: Some((i % 100_000) as i64),
                search_rank: None,
            }
        })
        .collect()
}

fn setup(result_cache: bool) -> GeoDash {
    let mut config = GeoDashConfig::in_memory();
    config.features.result_cache = result_cache;
    let geo = GeoDash::open(config).expect("Failed to open in-memory store");
    geo.store()
        .bulk_load(&synthetic_places(20_000))
        .expect("Failed to load synthetic gazetteer");
    geo
}

fn bench_resolve(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let queries = vec![
        ("short_prefix", QueryRequest::new("lo")),
        ("exact", QueryRequest::new("Lonparlon")),
        ("typo", QueryRequest::new("Lonprlon")),
        ("with_location", QueryRequest::new("Manterburg").near(48.85, 2.35)),
        ("country_filter", QueryRequest::new("Sanripar").in_country("FR")),
    ];

    let uncached = setup(false);
    let mut group = c.benchmark_group("resolve_uncached");
    group.sample_size(20);
    for (name, query) in &queries {
        group.bench_function(*name, |b| {
            b.iter(|| rt.block_on(uncached.search(query.clone())).unwrap());
        });
    }
    group.finish();

    let cached = setup(true);
    let mut group = c.benchmark_group("resolve_cached");
    for (name, query) in &queries {
        rt.block_on(cached.search(query.clone())).unwrap();
        group.bench_function(*name, |b| {
            b.iter(|| rt.block_on(cached.search(query.clone())).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_resolve);
criterion_main!(benches);
