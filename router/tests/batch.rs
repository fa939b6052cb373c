mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use embedmesh_router::{
    AgentEmbeddingProfile, BatchCoordinator, GenerateRequest, ModelPreference, ModelRouter,
    RouterConfig, RoutingError, Strategy,
};

use common::{ScriptedProvider, profile, request, router};

fn providers(results: &[Result<embedmesh_router::RouteOutcome, RoutingError>]) -> Vec<String> {
    results
        .iter()
        .map(|r| match r {
            Ok(outcome) => outcome.record().unwrap().provider.clone(),
            Err(err) => format!("error: {err}"),
        })
        .collect()
}

#[tokio::test]
async fn test_failing_item_does_not_affect_siblings() {
    let good = ScriptedProvider::new("model-good", 768).shared();
    let dead = ScriptedProvider::new("model-dead", 768).shared();
    let router = Arc::new(router(&[&good, &dead]));

    let profile = AgentEmbeddingProfile::new("agent", Strategy::Cost)
        .with_preference(ModelPreference::new("general_qa", &["model-good"]))
        .with_preference(ModelPreference::new("broken", &["model-dead"]))
        .with_fallback(embedmesh_router::FallbackBehavior {
            max_retries: 1,
            ..Default::default()
        });

    let settings = profile.fallback_behavior.circuit_breaker;
    for _ in 0..settings.failure_threshold {
        router.breaker("model-dead").record_failure(&settings);
    }

    let mut requests: Vec<GenerateRequest> = (0..5).map(|_| request("agent")).collect();
    requests[2] = request("agent").with_task_type("broken");

    let results = BatchCoordinator::new(router)
        .run_batch(&profile, &requests)
        .await
        .unwrap();

    assert_eq!(results.len(), 5);
    assert!(matches!(
        results[2],
        Err(RoutingError::AllProvidersExhausted { .. })
    ));
    for (i, result) in results.iter().enumerate() {
        if i != 2 {
            let record = result.as_ref().unwrap().record().unwrap();
            assert_eq!(record.provider, "model-good");
            assert_eq!(record.tenant_id, requests[i].tenant_id);
        }
    }
    assert_eq!(good.calls(), 4);
    assert_eq!(dead.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_results_keep_input_order() {
    let slow = ScriptedProvider::new("model-slow", 768)
        .with_delay(Duration::from_millis(500))
        .shared();
    let fast = ScriptedProvider::new("model-fast", 768).shared();
    let router = Arc::new(router(&[&slow, &fast]));

    let profile = AgentEmbeddingProfile::new("agent", Strategy::Speed)
        .with_preference(ModelPreference::new("slow", &["model-slow"]))
        .with_preference(ModelPreference::new("fast", &["model-fast"]));

    let requests: Vec<GenerateRequest> = ["slow", "fast", "slow", "fast"]
        .into_iter()
        .map(|task| request("agent").with_task_type(task))
        .collect();

    let results = BatchCoordinator::new(router)
        .run_batch(&profile, &requests)
        .await
        .unwrap();

    assert_eq!(
        providers(&results),
        vec!["model-slow", "model-fast", "model-slow", "model-fast"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_is_capped() {
    let slow = ScriptedProvider::new("model-slow", 768)
        .with_delay(Duration::from_millis(50))
        .shared();
    let router = Arc::new(router(&[&slow]));
    let profile = profile("agent", &["model-slow"], &[]);
    let requests: Vec<GenerateRequest> = (0..20).map(|_| request("agent")).collect();

    let coordinator = BatchCoordinator::new(router).with_concurrency(3);
    let results = coordinator.run_batch(&profile, &requests).await.unwrap();

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(slow.calls(), 20);
    assert_eq!(slow.max_in_flight(), 3);
}

#[tokio::test]
async fn test_oversized_batch_rejected() {
    let good = ScriptedProvider::new("model-good", 768).shared();
    let router = ModelRouter::builder()
        .with_config(RouterConfig::default().with_max_batch_size(2))
        .with_provider(good.clone())
        .build()
        .unwrap();
    let profile = profile("agent", &["model-good"], &[]);
    let requests: Vec<GenerateRequest> = (0..3).map(|_| request("agent")).collect();

    let err = BatchCoordinator::new(Arc::new(router))
        .run_batch(&profile, &requests)
        .await
        .unwrap_err();

    assert!(matches!(err, RoutingError::BatchTooLarge { size: 3, max: 2 }));
    assert_eq!(good.calls(), 0);
}

#[tokio::test]
async fn test_invalid_profile_fails_whole_batch() {
    let good = ScriptedProvider::new("model-good", 768).shared();
    let router = Arc::new(router(&[&good]));
    let mut profile = profile("agent", &["model-good"], &[]);
    profile.fallback_behavior.circuit_breaker.half_open_max_requests = 0;
    let requests: Vec<GenerateRequest> = (0..3).map(|_| request("agent")).collect();

    let err = BatchCoordinator::new(router)
        .run_batch(&profile, &requests)
        .await
        .unwrap_err();

    assert!(matches!(err, RoutingError::InvalidProfile(_)));
    assert_eq!(good.calls(), 0);
}

#[tokio::test]
async fn test_empty_batch() {
    let good = ScriptedProvider::new("model-good", 768).shared();
    let router = Arc::new(router(&[&good]));
    let profile = profile("agent", &["model-good"], &[]);

    let results = BatchCoordinator::new(router)
        .run_batch(&profile, &[])
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_keeps_finished_slots() {
    let slow = ScriptedProvider::new("model-slow", 768)
        .with_delay(Duration::from_secs(10))
        .shared();
    let fast = ScriptedProvider::new("model-fast", 768).shared();
    let router = Arc::new(router(&[&slow, &fast]));

    let profile = AgentEmbeddingProfile::new("agent", Strategy::Speed)
        .with_preference(ModelPreference::new("slow", &["model-slow"]))
        .with_preference(ModelPreference::new("fast", &["model-fast"]));

    // Four slow items, two at a time: two in flight, two waiting.
    let mut requests: Vec<GenerateRequest> = vec![request("agent").with_task_type("fast")];
    requests.extend((0..4).map(|_| request("agent").with_task_type("slow")));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let results = BatchCoordinator::new(router)
        .with_concurrency(2)
        .run_batch_with_cancel(&profile, &requests, &cancel)
        .await
        .unwrap();

    assert_eq!(results.len(), 5);
    assert_eq!(results[0].as_ref().unwrap().record().unwrap().provider, "model-fast");
    for result in &results[1..] {
        assert!(matches!(result, Err(RoutingError::Canceled)));
    }
    assert_eq!(slow.calls(), 2);
}
