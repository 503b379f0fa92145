// Benchmark suite for the feature rendering hot path.
//
// Run with: cargo bench --package polar-tiles-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use geo::{Coord, Geometry, LineString, Point, Polygon};
use polar_tiles_core::config::RenderConfig;
use polar_tiles_core::feature::SourceFeature;
use polar_tiles_core::renderer::FeatureRenderer;
use polar_tiles_core::stats::NoopStats;

/// A jagged ring approximating a coastline, centered in the world square.
fn coastline_polygon(points: usize) -> Polygon<f64> {
    let coords: Vec<Coord<f64>> = (0..=points)
        .map(|i| {
            let angle = i as f64 / points as f64 * std::f64::consts::TAU;
            let radius = 0.3 + 0.02 * (angle * 17.0).sin();
            Coord {
                x: 0.5 + radius * angle.cos(),
                y: 0.5 + radius * angle.sin(),
            }
        })
        .collect();
    Polygon::new(LineString::new(coords), vec![])
}

fn bench_render_polygon(c: &mut Criterion) {
    let config = RenderConfig::default();
    let stats = NoopStats;

    let mut group = c.benchmark_group("render_polygon");
    for max_zoom in [4u8, 8] {
        let feature = SourceFeature::new("coast", Geometry::Polygon(coastline_polygon(500)))
            .with_zoom_range(0, max_zoom);
        group.bench_with_input(
            BenchmarkId::new("max_zoom", max_zoom),
            &feature,
            |b, feature| {
                b.iter(|| {
                    let renderer = FeatureRenderer::new(&config, &stats, |f| {
                        black_box(&f);
                    });
                    renderer.render(feature);
                })
            },
        );
    }
    group.finish();
}

fn bench_render_points(c: &mut Criterion) {
    let config = RenderConfig::default();
    let stats = NoopStats;

    let features: Vec<SourceFeature> = (0..1000)
        .map(|i| {
            let t = i as f64 / 1000.0;
            SourceFeature::new(
                "poi",
                Geometry::Point(Point::new(0.05 + 0.9 * t, 0.05 + 0.9 * (t * 7.0).fract())),
            )
            .with_zoom_range(0, 8)
            .with_label_grid(64.0, 5)
        })
        .collect();

    let mut group = c.benchmark_group("render_points");
    group.throughput(Throughput::Elements(features.len() as u64));
    group.bench_function("labelled_points", |b| {
        b.iter(|| {
            let renderer = FeatureRenderer::new(&config, &stats, |f| {
                black_box(&f);
            });
            for feature in &features {
                renderer.render(feature);
            }
        })
    });
    group.finish();
}

criterion_group!(benches, bench_render_polygon, bench_render_points);
criterion_main!(benches);
