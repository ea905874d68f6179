//! Concurrent writers against one on-disk SQLite journal.

mod common;

use common::*;
use monfaristo::adapters::sqlite_adapter::SqliteAdapter;
use monfaristo::domain::cash::{CashMovementKind, NewCashMovement};
use monfaristo::domain::journal::{record_cash_movement, record_transaction};
use monfaristo::domain::money::{Money, Price, Quantity};
use monfaristo::domain::query::PositionFilter;
use monfaristo::ports::ledger_port::LedgerStore;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const THREADS: usize = 8;
const TRADES_PER_THREAD: usize = 5;

fn open_store(dir: &TempDir) -> SqliteAdapter {
    let store = SqliteAdapter::open(
        dir.path().join("journal.db"),
        THREADS as u32,
        Duration::from_secs(30),
    )
    .unwrap();
    store.initialize_schema().unwrap();
    store
}

#[test]
fn same_pair_buys_are_serialised() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let f = seed(&store);

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..TRADES_PER_THREAD {
                    record_transaction(&store, &buy(&f, &f.aapl, "100", "1", "1")).unwrap();
                }
            });
        }
    });

    let total = (THREADS * TRADES_PER_THREAD) as i64;
    let positions = store.positions(&PositionFilter::default()).unwrap();
    assert_eq!(positions.len(), 1);
    let p = &positions[0].position;
    assert_eq!(p.quantity, Quantity::new(total.into()));
    assert_eq!(p.total_buys, Quantity::new(total.into()));
    assert_eq!(p.avg_cost, Price::new(d("100")));
    assert_eq!(p.total_commission_cost, Money::new(total.into()));

    let accounts = store.cash_accounts(f.owner_id).unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].balance, Money::new((-101 * total).into()));
    assert_eq!(store.position_transactions(p.id).unwrap().len(), total as usize);
}

#[test]
fn first_deposits_share_one_cash_account() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let f = seed(&store);
    let key = settlement_key(&f);

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                let movement = NewCashMovement {
                    kind: CashMovementKind::Deposit,
                    amount: Money::new(d("25")),
                    executed_at: ts(1),
                    description: None,
                };
                record_cash_movement(&store, &key, &movement).unwrap();
            });
        }
    });

    let accounts = store.cash_accounts(f.owner_id).unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].balance, Money::new(d("200")));
    assert_eq!(store.cash_transactions(accounts[0].id).unwrap().len(), THREADS);
}

#[test]
fn disjoint_pairs_proceed_independently() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let f = seed(&store);

    thread::scope(|s| {
        for instrument in [&f.aapl, &f.nvda] {
            let store = &store;
            let f = &f;
            s.spawn(move || {
                for _ in 0..TRADES_PER_THREAD {
                    record_transaction(store, &buy(f, instrument, "10", "2", "0")).unwrap();
                }
                record_transaction(
                    store,
                    &sell(f, instrument, "12", &(2 * TRADES_PER_THREAD).to_string(), "0"),
                )
                .unwrap();
            });
        }
    });

    let positions = store.positions(&PositionFilter::default()).unwrap();
    assert_eq!(positions.len(), 2);
    for view in &positions {
        assert!(view.position.is_completed);
        assert_eq!(view.pnl_amount, Some(Money::new(d("20"))));
    }
}
