use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;

use corkboard_core::{
    move_item, BoardId, BoardView, Card, CardId, CardPatch, CardStatus, List, ListId, MutationEvent, UserId,
};

fn card(id: i64, list_id: i64, position: i64) -> Card {
    Card {
        id: CardId(id),
        title: format!("card-{id}"),
        description: String::new(),
        status: CardStatus::ToDo,
        list_id: ListId(list_id),
        board_id: BoardId(1),
        position,
        assigned_to: None,
        due_date: None,
    }
}

fn bench_move_item(c: &mut Criterion) {
    let mut group = c.benchmark_group("Ordering");
    for len in [10usize, 100, 1000] {
        let ids: Vec<CardId> = (0..len as i64).map(CardId).collect();
        group.throughput(Throughput::Elements(len as u64));
        group.bench_function(format!("move_first_to_last_{len}"), |b| {
            b.iter(|| move_item(black_box(&ids), 0, len - 1).unwrap())
        });
    }
    group.finish();
}

fn bench_view_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("View merge");
    group.throughput(Throughput::Elements(1));

    let mut view = BoardView::new(BoardId(1), UserId(1));
    view.load_lists(vec![List {
        id: ListId(1),
        title: "todo".into(),
        board_id: BoardId(1),
        position: 0,
    }]);
    view.load_cards(ListId(1), (0..200).map(|i| card(i, 1, i)).collect());

    let mut toggle = 0i64;
    group.bench_function("card_position_update", |b| {
        b.iter(|| {
            toggle = 199 - toggle;
            let patch = CardPatch::position(CardId(100), ListId(1), toggle);
            let event = MutationEvent::card_updated(BoardId(1), ListId(1), patch);
            black_box(view.apply(&event).unwrap());
        })
    });
    group.finish();
}

criterion_group!(benches, bench_move_item, bench_view_merge);
criterion_main!(benches);
