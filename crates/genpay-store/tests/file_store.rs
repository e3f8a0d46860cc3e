//! JSON ledger store integration tests.

use chrono::{Duration, Utc};
use rust_decimal_macros::dec;
use tempfile::TempDir;

use genpay_core::{
    Account, ChargeRecord, ChargeSource, FreeUsageRecord, Reservation, ReservationStatus, TaskId,
    UserId,
};
use genpay_store::{Batch, FileStoreOptions, JsonFileStore, Mutation, Store, StoreError};

async fn open(dir: &TempDir) -> JsonFileStore {
    JsonFileStore::open(dir.path().join("ledger.json"), FileStoreOptions::default())
        .await
        .unwrap()
}

fn user(id: i64) -> UserId {
    UserId::new(id).unwrap()
}

fn funded(id: i64, balance: rust_decimal::Decimal) -> Account {
    let mut account = Account::new(user(id));
    account.balance = balance;
    account
}

#[tokio::test]
async fn batch_is_written_together_and_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let task_id = TaskId::new("t-1").unwrap();

    {
        let store = open(&dir).await;
        store
            .apply(
                Batch::new()
                    .with(Mutation::PutAccount(funded(1, dec!(7))))
                    .with(Mutation::PutReservation(Reservation::pending(
                        task_id.clone(),
                        user(1),
                        dec!(3),
                        "veo",
                        serde_json::Value::Null,
                    )))
                    .with(Mutation::PutCharge(ChargeRecord::new(
                        task_id.clone(),
                        user(1),
                        dec!(3),
                        ChargeSource::ReservationCommit,
                    ))),
            )
            .await
            .unwrap();
    }

    let store = open(&dir).await;
    assert_eq!(store.get_account(user(1)).await.unwrap().unwrap().balance, dec!(7));
    assert_eq!(
        store.list_reservations(ReservationStatus::Pending).await.unwrap().len(),
        1
    );
    assert!(store.get_charge(&task_id).await.unwrap().is_some());
}

#[tokio::test]
async fn invalid_batch_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    store
        .apply(Batch::from(Mutation::PutAccount(funded(1, dec!(5)))))
        .await
        .unwrap();

    let err = store
        .apply(
            Batch::new()
                .with(Mutation::PutAccount(funded(2, dec!(9))))
                .with(Mutation::PutAccount(funded(1, dec!(-1)))),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Corruption(_)));

    assert_eq!(store.get_account(user(1)).await.unwrap().unwrap().balance, dec!(5));
    assert!(store.get_account(user(2)).await.unwrap().is_none());
}

#[tokio::test]
async fn free_usage_is_filtered_and_pruned() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;

    let mut old = FreeUsageRecord::new(user(1), "z-image", None);
    old.created_at = Utc::now() - Duration::days(2);
    store
        .apply(
            Batch::new()
                .with(Mutation::AppendFreeUsage(old))
                .with(Mutation::AppendFreeUsage(FreeUsageRecord::new(
                    user(1),
                    "z-image",
                    Some("job-1".into()),
                )))
                .with(Mutation::AppendFreeUsage(FreeUsageRecord::new(
                    user(1),
                    "flux",
                    None,
                )))
                .with(Mutation::PruneFreeUsage {
                    created_before: Utc::now() - Duration::hours(24),
                    max_records: 10_000,
                }),
        )
        .await
        .unwrap();

    let records = store.list_free_usage(user(1), "z-image").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].job_id.as_deref(), Some("job-1"));

    store
        .apply(Batch::from(Mutation::DeleteFreeUsage {
            user_id: user(1),
            model_id: "z-image".into(),
            job_id: Some("job-1".into()),
        }))
        .await
        .unwrap();
    assert!(store.list_free_usage(user(1), "z-image").await.unwrap().is_empty());
    assert_eq!(store.list_free_usage(user(1), "flux").await.unwrap().len(), 1);
}

#[tokio::test]
async fn referrals_and_events_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let now = Utc::now();

    store
        .apply(
            Batch::new()
                .with(Mutation::PutReferral {
                    user_id: user(2),
                    referrer_id: user(1),
                })
                .with(Mutation::PutReferral {
                    user_id: user(3),
                    referrer_id: user(1),
                })
                .with(Mutation::PutReferralBonus {
                    user_id: user(1),
                    bonus: 10,
                })
                .with(Mutation::PutProcessedEvent {
                    event_id: "old".into(),
                    processed_at: now - Duration::days(2),
                })
                .with(Mutation::PutProcessedEvent {
                    event_id: "new".into(),
                    processed_at: now,
                })
                .with(Mutation::PruneProcessedEvents {
                    processed_before: now - Duration::hours(24),
                }),
        )
        .await
        .unwrap();

    assert_eq!(store.get_referrer(user(2)).await.unwrap(), Some(user(1)));
    assert_eq!(store.get_referrer(user(1)).await.unwrap(), None);
    let mut referred = store.list_referrals(user(1)).await.unwrap();
    referred.sort();
    assert_eq!(referred, vec![user(2), user(3)]);
    assert_eq!(store.get_referral_bonus(user(1)).await.unwrap(), 10);

    assert!(store.has_processed_event("new").await.unwrap());
    assert!(!store.has_processed_event("old").await.unwrap());
}
