//! Benchmarks for PartySync coordinator operations

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use partysync::config::Config;
use partysync::coordinator::Coordinator;
use partysync::store::{MemoryStore, SharedStore};
use uuid::Uuid;

fn coordinator() -> Coordinator {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    Coordinator::new(store, &Config::default())
}

fn coordinator_benchmarks(c: &mut Criterion) {
    let coord = coordinator();

    c.bench_function("create_disband", |b| {
        b.iter(|| {
            let leader = Uuid::new_v4();
            coord.create_party(leader).unwrap();
            coord.disband(leader).unwrap();
        })
    });

    c.bench_function("invite_accept_leave", |b| {
        let leader = Uuid::new_v4();
        coord.create_party(leader).unwrap();
        b.iter(|| {
            let member = Uuid::new_v4();
            coord.invite(leader, member).unwrap();
            coord.accept_invite(member, leader).unwrap();
            coord.leave_party(member).unwrap();
        })
    });

    c.bench_function("leader_handover", |b| {
        b.iter(|| {
            let leader = Uuid::new_v4();
            let others: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
            coord.create_party(leader).unwrap();
            for other in &others {
                coord.invite(leader, *other).unwrap();
                coord.accept_invite(*other, leader).unwrap();
            }
            coord.leave_party(leader).unwrap();
            coord.disband(others[0]).unwrap();
        })
    });
}

criterion_group!(benches, coordinator_benchmarks);
criterion_main!(benches);
