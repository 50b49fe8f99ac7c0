use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use rayon::prelude::*;
use unitable::UniqueTable;

const ITER: u64 = 32 * 1024;
const TABLE_SIZE: u64 = 64 * 1024;

fn task_insert_pairs(table: &UniqueTable) {
    (0..ITER).into_par_iter().for_each(|key| {
        let worker = table.worker(rayon::current_thread_index().unwrap_or(0));
        worker.lookup(key, !key).unwrap();
    });
}

fn single_thread_insert_pairs(c: &mut Criterion) {
    let mut group = c.benchmark_group("UniqueTable/single_thread_insert_pairs");
    group.throughput(Throughput::Elements(ITER));
    group.bench_function("1", |bencher| {
        bencher.iter(|| {
            let table = UniqueTable::create(TABLE_SIZE, TABLE_SIZE, 1);
            let worker = table.worker(0);
            for key in 0..ITER {
                worker.lookup(key, !key).unwrap();
            }
            table
        })
    });
    group.finish();
}

fn single_thread_get_inserted_pairs(c: &mut Criterion) {
    let mut group = c.benchmark_group("UniqueTable/single_thread_get_inserted_pairs");
    group.throughput(Throughput::Elements(ITER));
    let table = UniqueTable::create(TABLE_SIZE, TABLE_SIZE, 1);
    let worker = table.worker(0);
    for key in 0..ITER {
        worker.lookup(key, !key).unwrap();
    }
    group.bench_function("1", |bencher| {
        bencher.iter(|| {
            for key in 0..ITER {
                worker.lookup(key, !key).unwrap();
            }
        })
    });
    group.finish();
}

fn create_and_insert_pairs(c: &mut Criterion) {
    let mut group = c.benchmark_group("UniqueTable/create_and_insert_pairs");
    group.throughput(Throughput::Elements(ITER));
    let max = num_cpus::get();

    for threads in (1..=max).filter(|thread| *thread == 1 || *thread % 4 == 0) {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |bencher, &threads| {
                let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build().unwrap();
                pool.install(|| {
                    bencher.iter(|| {
                        let table = UniqueTable::create(TABLE_SIZE, TABLE_SIZE, threads);
                        task_insert_pairs(&table);
                        table
                    })
                });
            },
        );
    }

    group.finish();
}

fn get_already_inserted_pairs(c: &mut Criterion) {
    let mut group = c.benchmark_group("UniqueTable/get_already_inserted_pairs");
    group.throughput(Throughput::Elements(ITER));
    let max = num_cpus::get();

    for threads in (1..=max).filter(|thread| *thread == 1 || *thread % 4 == 0) {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |bencher, &threads| {
                let table = UniqueTable::create(TABLE_SIZE, TABLE_SIZE, threads);
                let worker = table.worker(0);
                for key in 0..ITER {
                    worker.lookup(key, !key).unwrap();
                }
                let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build().unwrap();
                pool.install(|| bencher.iter(|| task_insert_pairs(&table)));
            },
        );
    }

    group.finish();
}

fn collect_and_rehash(c: &mut Criterion) {
    let mut group = c.benchmark_group("UniqueTable/collect_and_rehash");
    group.throughput(Throughput::Elements(ITER));
    group.bench_function("1", |bencher| {
        bencher.iter_batched(
            || {
                let table = UniqueTable::create(TABLE_SIZE, TABLE_SIZE, 1);
                let worker = table.worker(0);
                let indices: Vec<u64> =
                    (0..ITER).map(|key| worker.lookup(key, !key).unwrap().0).collect();
                (table, indices)
            },
            |(mut table, indices)| {
                table.clear();
                for index in indices {
                    table.mark(index);
                }
                table.rehash();
                table
            },
            BatchSize::LargeInput,
        )
    });
    group.finish();
}

criterion_group!(
    benches,
    single_thread_insert_pairs,
    single_thread_get_inserted_pairs,
    create_and_insert_pairs,
    get_already_inserted_pairs,
    collect_and_rehash
);
criterion_main!(benches);
