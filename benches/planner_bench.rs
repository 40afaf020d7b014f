use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use stage_scan::grid::{
    bounding_rect, swept_region, Course, GridDefinition, GridExtent, GridPathPlanner,
};

fn matrix(columns: u32, rows: u32, course: Course) -> GridDefinition {
    GridDefinition {
        start: (0, 0),
        tile_size: (1000, 800),
        non_overlap: (0.9, 0.85),
        course,
        extent: GridExtent::Matrix { columns, rows },
    }
}

fn benchmark_plan_sizes(c: &mut Criterion) {
    let planner = GridPathPlanner::new();
    let mut group = c.benchmark_group("plan_matrix");
    for side in [10u32, 100, 300] {
        let definition = matrix(side, side, Course::VRight);
        group.bench_with_input(BenchmarkId::from_parameter(side), &definition, |b, def| {
            b.iter(|| planner.plan(black_box(def)))
        });
    }
    group.finish();
}

fn benchmark_plan_from_bounds(c: &mut Criterion) {
    let planner = GridPathPlanner::new().with_realignment(true);
    let definition = GridDefinition {
        start: (-50_000, -20_000),
        tile_size: (1000, 800),
        non_overlap: (0.9, 0.85),
        course: Course::HLeft,
        extent: GridExtent::FinalPoint((-150_000, 40_000)),
    };
    c.bench_function("plan_from_bounds", |b| {
        b.iter(|| planner.plan(black_box(&definition)))
    });
}

fn benchmark_geometry(c: &mut Criterion) {
    let Ok(plan) = GridPathPlanner::new().plan(&matrix(100, 100, Course::HRight)) else {
        return;
    };
    let tile = plan.definition.tile_size;

    c.bench_function("bounding_rect_10k", |b| {
        b.iter(|| bounding_rect(black_box(&plan.points), tile))
    });

    c.bench_function("swept_regions_10k", |b| {
        b.iter(|| {
            plan.points
                .windows(2)
                .filter_map(|w| swept_region(w[0], w[1], tile).ok())
                .count()
        })
    });

    c.bench_function("translate_10k", |b| {
        b.iter(|| plan.translated_to(black_box((5000, 5000))))
    });
}

criterion_group!(
    benches,
    benchmark_plan_sizes,
    benchmark_plan_from_bounds,
    benchmark_geometry
);
criterion_main!(benches);
