//! Free-tier limiter and referral integration tests.

mod common;

use common::{failure, success, task, user, TestHarness, FREE_MODEL};
use futures::future::join_all;
use rust_decimal::Decimal;

use genpay_core::{JobStatus, LimitReason, UserId};
use genpay_engine::{FreeGenerationRequest, FreeSlot, GenerationState, Progress};

fn free(id: &str, requester: UserId) -> FreeGenerationRequest {
    FreeGenerationRequest {
        task_id: task(id),
        user_id: requester,
        chat_id: None,
        model_id: FREE_MODEL.into(),
        input: serde_json::json!({"prompt": "a paper boat"}),
    }
}

// ============================================================================
// Limits
// ============================================================================

#[tokio::test]
async fn concurrent_reserves_stop_at_the_limit() {
    let harness = TestHarness::new().await;
    let limiter = harness.engine.limiter();
    let requester = user(1);

    let decisions = join_all(
        (0..20).map(|_| limiter.check_limits_and_reserve(requester, FREE_MODEL, None)),
    )
    .await;

    let allowed = decisions.iter().filter(|d| d.as_ref().unwrap().allowed).count();
    assert_eq!(allowed, 5);
    assert_eq!(
        harness
            .store
            .list_free_usage(requester, FREE_MODEL)
            .await
            .unwrap()
            .len(),
        5
    );
}

#[tokio::test]
async fn five_allowed_sixth_refused() {
    let harness = TestHarness::new().await;
    let limiter = harness.engine.limiter();
    let requester = user(2);

    for n in 1..=5 {
        let decision = limiter
            .check_limits_and_reserve(requester, FREE_MODEL, Some(&format!("job-{n}")))
            .await
            .unwrap();
        assert!(decision.allowed, "call {n} should be allowed");
        assert_eq!(decision.reason, LimitReason::Ok);
    }

    let sixth = limiter
        .check_limits_and_reserve(requester, FREE_MODEL, Some("job-6"))
        .await
        .unwrap();
    assert!(!sixth.allowed);
    assert_eq!(sixth.reason, LimitReason::HourlyLimitExceeded);

    let status = limiter.check_limits(requester, FREE_MODEL).await.unwrap();
    assert_eq!(status.hourly_used, 5);
    assert_eq!(status.daily_used, 5);
    assert!(!status.allowed);
}

#[tokio::test]
async fn users_and_models_are_counted_apart() {
    let harness = TestHarness::new().await;
    let limiter = harness.engine.limiter();

    for _ in 0..5 {
        limiter
            .check_limits_and_reserve(user(3), FREE_MODEL, None)
            .await
            .unwrap();
    }

    assert!(limiter
        .check_limits_and_reserve(user(4), FREE_MODEL, None)
        .await
        .unwrap()
        .allowed);
    assert_eq!(
        limiter
            .check_limits_and_reserve(user(3), "veo", None)
            .await
            .unwrap()
            .reason,
        LimitReason::NotFree
    );
}

// ============================================================================
// Free generation
// ============================================================================

#[tokio::test]
async fn successful_free_generation_keeps_the_slot() {
    let harness = TestHarness::new().await;
    let requester = user(30);
    harness.api.set_final(success(&["https://cdn.example/boat.png"]));

    let outcome = harness
        .engine
        .run_free_generation(free("free-ok", requester), &mut |_: Progress| {})
        .await
        .unwrap();

    assert_eq!(outcome.slot, FreeSlot::Kept);
    assert_eq!(outcome.limits.hourly_used, 1);
    assert_eq!(outcome.generation.unwrap().state, GenerationState::Success);
    assert_eq!(
        harness.store.list_free_usage(requester, FREE_MODEL).await.unwrap().len(),
        1
    );

    let job = harness.engine.jobs().get_job(&task("free-ok")).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.price, Decimal::ZERO);
}

#[tokio::test]
async fn failed_free_generation_returns_the_slot() {
    let harness = TestHarness::new().await;
    let requester = user(31);
    harness.api.set_final(failure("500", "upstream error"));

    let outcome = harness
        .engine
        .run_free_generation(free("free-fail", requester), &mut |_: Progress| {})
        .await
        .unwrap();

    assert_eq!(outcome.slot, FreeSlot::Returned);
    assert_eq!(outcome.generation.unwrap().state, GenerationState::Fail);
    assert!(harness
        .store
        .list_free_usage(requester, FREE_MODEL)
        .await
        .unwrap()
        .is_empty());

    let job = harness.engine.jobs().get_job(&task("free-fail")).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn timed_out_free_generation_returns_the_slot() {
    let harness = TestHarness::new().await;
    let requester = user(32);

    let outcome = harness
        .engine
        .run_free_generation(free("free-slow", requester), &mut |_: Progress| {})
        .await
        .unwrap();

    assert_eq!(outcome.slot, FreeSlot::Returned);
    assert_eq!(outcome.generation.unwrap().state, GenerationState::Timeout);
    let status = harness.engine.limiter().check_limits(requester, FREE_MODEL).await.unwrap();
    assert_eq!(status.hourly_used, 0);
    assert!(status.allowed);
}

#[tokio::test]
async fn refused_free_generation_never_reaches_the_api() {
    let harness = TestHarness::new().await;
    let requester = user(33);
    for _ in 0..5 {
        harness
            .engine
            .limiter()
            .check_limits_and_reserve(requester, FREE_MODEL, None)
            .await
            .unwrap();
    }

    let outcome = harness
        .engine
        .run_free_generation(free("free-over", requester), &mut |_: Progress| {})
        .await
        .unwrap();

    assert_eq!(outcome.slot, FreeSlot::NotTaken);
    assert_eq!(outcome.limits.reason, LimitReason::HourlyLimitExceeded);
    assert!(outcome.generation.is_none());
    assert_eq!(harness.api.create_calls(), 0);
    assert!(harness.engine.jobs().get_job(&task("free-over")).await.unwrap().is_none());
}

// ============================================================================
// Referrals
// ============================================================================

#[tokio::test]
async fn referral_bonus_extends_hourly_limit() {
    let harness = TestHarness::new().await;
    let referrer = user(10);
    let referrals = harness.engine.referrals();
    let limiter = harness.engine.limiter();

    assert!(referrals.set_referrer(user(11), referrer).await.unwrap());
    assert!(!referrals.set_referrer(user(11), referrer).await.unwrap());

    let allowed = join_all(
        (0..15).map(|_| limiter.check_limits_and_reserve(referrer, FREE_MODEL, None)),
    )
    .await
    .iter()
    .filter(|d| d.as_ref().unwrap().allowed)
    .count();
    assert_eq!(allowed, 10);

    let info = referrals.referral_info(referrer).await.unwrap();
    assert_eq!(info.referrals_count, 1);
    assert_eq!(info.bonus_generations, 5);
    assert_eq!(info.hourly_limit, 10);
}

#[tokio::test]
async fn concurrent_referrals_credit_once() {
    let harness = TestHarness::new().await;
    let referrals = harness.engine.referrals();

    let results = join_all((0..6).map(|_| referrals.set_referrer(user(21), user(20)))).await;

    let recorded = results.iter().filter(|r| *r.as_ref().unwrap()).count();
    assert_eq!(recorded, 1);
    assert_eq!(referrals.get_referral_bonus(user(20)).await.unwrap(), 5);
}
