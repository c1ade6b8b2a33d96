use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tabula_core::{orders_contiguous, plan_insert, plan_move, plan_soft_delete, OrderedItem, Scope};
use uuid::Uuid;

fn populate_scope(n: i64) -> Vec<OrderedItem> {
    let scope = Scope::team(Uuid::new_v4());
    let actor = Uuid::new_v4();
    (1..=n)
        .map(|order| OrderedItem::new(Uuid::new_v4(), scope, format!("item {order}"), order, actor))
        .collect()
}

fn bench_plan_move(c: &mut Criterion) {
    let mut group = c.benchmark_group("Reindex Planning");
    group.throughput(Throughput::Elements(1));

    for n in [100_i64, 1_000] {
        let items = populate_scope(n);
        // Worst case: last item to the front touches every live item.
        let last = items[(n - 1) as usize].id;

        group.bench_function(format!("plan_move_front_{n}"), |b| {
            b.iter(|| {
                let plan = plan_move(black_box(&items), black_box(last), 1)
                    .unwrap()
                    .unwrap();
                black_box(plan);
            })
        });
    }

    group.finish();
}

fn bench_plan_insert_and_delete(c: &mut Criterion) {
    let mut group = c.benchmark_group("Reindex Planning");
    group.throughput(Throughput::Elements(1));

    let items = populate_scope(1_000);
    group.bench_function("plan_insert_head_1000", |b| {
        b.iter(|| {
            let plan = plan_insert(black_box(&items), Uuid::new_v4(), 0).unwrap();
            black_box(plan);
        })
    });

    let middle = items[500].id;
    group.bench_function("plan_soft_delete_middle_1000", |b| {
        b.iter(|| {
            let plan = plan_soft_delete(black_box(&items), black_box(middle)).unwrap();
            black_box(plan);
        })
    });

    group.finish();
}

fn bench_contiguity_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("Invariant Check");
    group.throughput(Throughput::Elements(1_000));

    let items = populate_scope(1_000);
    group.bench_function("orders_contiguous_1000", |b| {
        b.iter(|| black_box(orders_contiguous(black_box(&items))))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_plan_move,
    bench_plan_insert_and_delete,
    bench_contiguity_check
);
criterion_main!(benches);
