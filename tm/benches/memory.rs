// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use criterion::{criterion_group, criterion_main, Criterion};
use stronghold_tm::Stm;

pub fn bench_write_commit(c: &mut Criterion) {
    c.bench_function("write_commit", |b| {
        let stm = Stm::new(64, 8).expect("failed to create region");
        let start = stm.start();

        b.iter(|| {
            let mut tx = stm.begin(false);
            tx.write(&1u64.to_le_bytes(), start).expect("write failed");
            tx.commit().expect("commit failed");
        })
    });
}

pub fn bench_read_only(c: &mut Criterion) {
    c.bench_function("read_only", |b| {
        let stm = Stm::new(64, 8).expect("failed to create region");
        let start = stm.start();

        b.iter(|| {
            let mut word = [0u8; 8];
            let mut tx = stm.begin(true);
            tx.read(start, &mut word).expect("read failed");
            tx.commit().expect("commit failed");
        })
    });
}

criterion_group!(benches, bench_write_commit, bench_read_only);
criterion_main!(benches);
