use criterion::{black_box, criterion_group, criterion_main, Criterion};

use valence_core::{Atom, PrimitiveAtom, Store};

fn bench_cached_read(c: &mut Criterion) {
    let store = Store::new();
    let base = PrimitiveAtom::primitive(1u64);
    let derived = {
        let base = base.clone();
        Atom::derived(move |get| Ok(get.get(&base)? * 2))
    };
    store.get(&derived).unwrap();

    c.bench_function("cached_read", |b| {
        b.iter(|| black_box(store.get(&derived).unwrap()))
    });
}

fn bench_write_propagation(c: &mut Criterion) {
    let store = Store::new();
    let base = PrimitiveAtom::primitive(0u64);
    let mut tail = base.as_atom().clone();
    // A chain of ten derived atoms over one primitive.
    for _ in 0..10 {
        let prev = tail.clone();
        tail = Atom::derived(move |get| Ok(get.get(&prev)? + 1));
    }
    let _sub = store.sub(&tail, || {});

    let mut n = 0u64;
    c.bench_function("write_chain_10", |b| {
        b.iter(|| {
            n += 1;
            store.set(&base, n).unwrap();
            black_box(store.get(&tail).unwrap())
        })
    });
}

fn bench_diamond(c: &mut Criterion) {
    let store = Store::new();
    let source = PrimitiveAtom::primitive(0u64);
    let left = {
        let source = source.clone();
        Atom::derived(move |get| Ok(get.get(&source)? + 1))
    };
    let right = {
        let source = source.clone();
        Atom::derived(move |get| Ok(get.get(&source)? * 3))
    };
    let bottom = {
        let left = left.clone();
        let right = right.clone();
        Atom::derived(move |get| Ok(get.get(&left)? + get.get(&right)?))
    };
    let _sub = store.sub(&bottom, || {});

    let mut n = 0u64;
    c.bench_function("write_diamond", |b| {
        b.iter(|| {
            n += 1;
            store.set(&source, n).unwrap();
            black_box(store.get(&bottom).unwrap())
        })
    });
}

criterion_group!(benches, bench_cached_read, bench_write_propagation, bench_diamond);
criterion_main!(benches);
