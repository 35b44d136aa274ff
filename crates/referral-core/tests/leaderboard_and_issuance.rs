use chrono::{DateTime, TimeZone, Utc};
use referral_core::storage::{CodeStore, ProfileStore, TrackingStore};
use referral_core::{
    CodeGenerator, CodeIssuer, InMemoryReferralStorage, IssuerConfig, LeaderboardPeriod,
    LeaderboardScope, NewTracking, Profile, ProfileRole, ReferralError, ReferralStorage,
    StatsAggregator, TrackingStatus,
};
use std::sync::Arc;
use uuid::Uuid;

fn tracking(trainer_id: Uuid, status: TrackingStatus) -> NewTracking {
    NewTracking {
        code_id: Uuid::new_v4(),
        trainer_id,
        participant_id: Uuid::new_v4(),
        enrollment_id: Uuid::new_v4(),
        program_id: Uuid::new_v4(),
        discount_applied: 25_000,
        commission_earned: 0,
        status,
    }
}

fn at(day: u32, month: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, month, day, 9, 0, 0).unwrap()
}

#[tokio::test]
async fn scenario_d_monthly_window_counts_only_this_month() {
    let store = Arc::new(InMemoryReferralStorage::new());
    let trainer = Uuid::new_v4();
    store
        .upsert_profile(Profile {
            id: trainer,
            full_name: "Dewi Lestari".to_string(),
            email: "dewi@example.com".to_string(),
            role: ProfileRole::Trainer,
        })
        .await
        .unwrap();

    store
        .insert_tracking(tracking(trainer, TrackingStatus::Confirmed), at(2, 5))
        .await
        .unwrap();
    for day in [6, 9, 14] {
        store
            .insert_tracking(tracking(trainer, TrackingStatus::Pending), at(day, 5))
            .await
            .unwrap();
    }
    for day in [10, 28] {
        store
            .insert_tracking(tracking(trainer, TrackingStatus::Confirmed), at(day, 4))
            .await
            .unwrap();
    }

    let stats = StatsAggregator::new(store.clone());
    let now = Utc.with_ymd_and_hms(2024, 5, 16, 12, 0, 0).unwrap();

    let month = stats
        .leaderboard_at(LeaderboardScope::Trainer, LeaderboardPeriod::Month, None, now)
        .await
        .unwrap();
    assert_eq!(month.len(), 1);
    assert_eq!(month[0].rank, 1);
    assert_eq!(month[0].actor_name, "Dewi Lestari");
    assert_eq!(month[0].total_referrals, 4);
    assert_eq!(month[0].confirmed_referrals, 1);
    assert_eq!(month[0].pending_referrals, 3);
    assert_eq!(month[0].conversion_rate, 25.0);
    assert_eq!(month[0].total_discount_given, 100_000);
    assert_eq!(month[0].last_referral_date, Some(at(14, 5)));

    let all = stats
        .leaderboard_at(LeaderboardScope::Trainer, LeaderboardPeriod::All, None, now)
        .await
        .unwrap();
    assert_eq!(all[0].total_referrals, 6);
    assert_eq!(all[0].conversion_rate, 50.0);

    let users = stats
        .leaderboard_at(LeaderboardScope::User, LeaderboardPeriod::Month, None, now)
        .await
        .unwrap();
    assert!(users.is_empty());
}

#[tokio::test]
async fn empty_window_yields_empty_leaderboard() {
    let store: Arc<dyn ReferralStorage> = Arc::new(InMemoryReferralStorage::new());
    let stats = StatsAggregator::new(store);
    let board = stats
        .leaderboard(LeaderboardScope::Trainer, LeaderboardPeriod::Week, Some(10))
        .await
        .unwrap();
    assert!(board.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_e_concurrent_issuance_converges_on_one_code() {
    let store: Arc<dyn ReferralStorage> = Arc::new(InMemoryReferralStorage::new());
    let issuer = CodeIssuer::new(store.clone(), IssuerConfig::default());
    let trainer = Uuid::new_v4();

    let tasks = (0..8).map(|_| {
        let issuer = issuer.clone();
        tokio::spawn(async move { issuer.get_or_create(trainer).await })
    });
    let codes = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked").expect("issued"))
        .collect::<Vec<_>>();

    let first = &codes[0];
    assert!(codes.iter().all(|c| c.id == first.id && c.code == first.code));
    assert!(first.is_active);
    assert_eq!(first.trainer_id, trainer);

    let found = store.find_code(&first.code).await.unwrap().unwrap();
    assert_eq!(found.id, first.id);
}

struct Colliding;

impl CodeGenerator for Colliding {
    fn generate(&self, _length: usize) -> String {
        "TAKEN1".to_string()
    }
}

#[tokio::test]
async fn issuance_gives_up_after_bounded_collisions() {
    let store: Arc<dyn ReferralStorage> = Arc::new(InMemoryReferralStorage::new());
    let issuer = CodeIssuer::with_generator(store, IssuerConfig::default(), Arc::new(Colliding));

    issuer.get_or_create(Uuid::new_v4()).await.unwrap();
    assert!(matches!(
        issuer.get_or_create(Uuid::new_v4()).await,
        Err(ReferralError::GenerationExhausted { attempts: 20 })
    ));
}
