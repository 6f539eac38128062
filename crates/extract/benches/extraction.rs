//! Benchmarks for zonal extraction

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use geo_types::polygon;
use ndarray::Array3;
use phytostat_core::{CRS, Feature, FeatureCollection, GeoTransform, MemoryRaster};
use phytostat_extract::{
    extract, CancellationToken, ExtractConfig, RegisteredSource, SourceKind, SourceSet, TileMode,
};
use std::sync::Arc;

fn create_sources(size: usize, bands: usize) -> SourceSet {
    let data = Array3::from_shape_fn((bands, size, size), |(b, r, c)| {
        (100 + b * 10 + (r * 7 + c * 13) % 200) as u16
    });
    let hsi = MemoryRaster::new(data, GeoTransform::new(0.0, size as f64, 1.0, -1.0))
        .with_crs(CRS::from_epsg(32619));

    let coarse = size / 10;
    let chm = Array3::from_shape_fn((1, coarse, coarse), |(_, r, c)| (r + c) as f32 * 0.5);
    let chm = MemoryRaster::new(chm, GeoTransform::new(0.0, size as f64, 10.0, -10.0))
        .with_crs(CRS::from_epsg(32619));

    SourceSet::new(vec![
        RegisteredSource::new("hsi", Arc::new(hsi), SourceKind::Passive),
        RegisteredSource::new("chm", Arc::new(chm), SourceKind::Active).with_labels(vec!["chm"]),
    ])
    .unwrap()
}

fn create_crowns(size: usize, n: usize) -> FeatureCollection {
    let span = (size - 20) as f64;
    let features = (0..n)
        .map(|i| {
            let x = 5.0 + ((i * 7919) % 10_000) as f64 / 10_000.0 * span;
            let y = 5.0 + ((i * 104_729) % 10_000) as f64 / 10_000.0 * span;
            let s = 3.0 + (i % 6) as f64;
            Feature::new(
                format!("crown-{i}"),
                polygon![(x: x, y: y), (x: x + s, y: y), (x: x + s, y: y + s), (x: x, y: y + s)],
            )
        })
        .collect();
    FeatureCollection::from_features(CRS::from_epsg(32619), features)
}

fn bench_modes(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract/modes");
    let sources = create_sources(1000, 8);
    let crowns = create_crowns(1000, 2000);
    for mode in [TileMode::Auto, TileMode::PerFeature, TileMode::Tiled] {
        let config = ExtractConfig::default()
            .with_tile_mode(mode)
            .with_tile_size(Some(256));
        group.bench_with_input(BenchmarkId::from_parameter(mode), &mode, |b, _| {
            b.iter(|| {
                extract(
                    black_box(&sources),
                    black_box(&crowns),
                    &config,
                    &CancellationToken::new(),
                )
                .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_feature_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract/features");
    let sources = create_sources(1000, 8);
    for n in [100, 1000, 5000] {
        let crowns = create_crowns(1000, n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                extract(
                    black_box(&sources),
                    black_box(&crowns),
                    &ExtractConfig::default(),
                    &CancellationToken::new(),
                )
                .unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_modes, bench_feature_count);
criterion_main!(benches);
