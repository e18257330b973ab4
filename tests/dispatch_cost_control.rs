mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeZone;
use chrono::Utc;

use common::{batch, clock, reply, t0, FlakyDelivery, RecordingSink, ScriptedSummarizer};
use finnews_digest::clock::{Clock, ManualClock};
use finnews_digest::dispatch::DailyBudget;
use finnews_digest::{Category, DispatchError, DispatchOutcome, Dispatcher, DispatcherConfig};

// Sonnet pricing: 1000 in + 200 out costs $0.006 per call.
const MODEL: &str = "claude-sonnet-4";

struct Rig {
    dispatcher: Dispatcher,
    summarizer: Arc<ScriptedSummarizer>,
    delivery: Arc<FlakyDelivery>,
    sink: Arc<RecordingSink>,
    clock: Arc<ManualClock>,
}

fn rig(cfg: DispatcherConfig, ceiling_usd: Option<f64>, summarizer: ScriptedSummarizer) -> Rig {
    let summarizer = Arc::new(summarizer);
    let delivery = Arc::new(FlakyDelivery::reliable());
    let sink = Arc::new(RecordingSink::default());
    let clock = clock();
    let dispatcher = Dispatcher::new(
        cfg,
        summarizer.clone(),
        delivery.clone(),
        DailyBudget::new(ceiling_usd, t0()),
        clock.clone(),
        sink.clone(),
    );
    Rig {
        dispatcher,
        summarizer,
        delivery,
        sink,
        clock,
    }
}

#[tokio::test]
async fn exhausted_budget_drops_without_calling_summarizer_until_next_day() {
    let mut r = rig(DispatcherConfig::default(), Some(0.01), ScriptedSummarizer::new(MODEL));

    for id in 1..=2 {
        let out = r.dispatcher.submit(batch(id, Category::Macro, 2)).await;
        assert_eq!(out, Ok(DispatchOutcome::Delivered { parts: 1 }));
    }
    assert!(r.dispatcher.spent_today() >= 0.01);

    let out = r.dispatcher.submit(batch(3, Category::Macro, 2)).await;
    assert_eq!(out, Err(DispatchError::BudgetExhausted));
    assert_eq!(r.summarizer.calls(), 2);
    assert_eq!(r.sink.kinds(), vec!["budget_exhausted"]);
    assert_eq!(r.dispatcher.monitor().stats().dropped_budget, 1);

    r.clock
        .set(Utc.with_ymd_and_hms(2025, 9, 18, 0, 0, 5).unwrap());
    assert_eq!(r.dispatcher.spent_today(), 0.0);
    let out = r.dispatcher.submit(batch(4, Category::Macro, 2)).await;
    assert_eq!(out, Ok(DispatchOutcome::Delivered { parts: 1 }));
    assert_eq!(r.summarizer.calls(), 3);
}

#[tokio::test]
async fn no_ceiling_means_unlimited_spend() {
    let summarizer = ScriptedSummarizer::new(MODEL).then(reply("Big day.", 2_000_000, 100_000));
    let cfg = DispatcherConfig {
        tokens_per_day: 0,
        ..DispatcherConfig::default()
    };
    let mut r = rig(cfg, None, summarizer);

    for id in 1..=3 {
        let out = r.dispatcher.submit(batch(id, Category::Equities, 1)).await;
        assert!(matches!(out, Ok(DispatchOutcome::Delivered { .. })));
    }
    assert!(r.dispatcher.spent_today() > 7.0);
    assert!(r.sink.events().is_empty());
    assert_eq!(r.dispatcher.monitor().stats().ceiling_usd, None);
}

#[tokio::test]
async fn call_ceiling_queues_then_pump_delivers_in_order() {
    let cfg = DispatcherConfig {
        calls_per_minute: 2,
        ..DispatcherConfig::default()
    };
    let mut r = rig(cfg, None, ScriptedSummarizer::new(MODEL));

    assert!(matches!(
        r.dispatcher.submit(batch(1, Category::Macro, 1)).await,
        Ok(DispatchOutcome::Delivered { .. })
    ));
    assert!(matches!(
        r.dispatcher.submit(batch(2, Category::Crypto, 1)).await,
        Ok(DispatchOutcome::Delivered { .. })
    ));
    assert_eq!(
        r.dispatcher.submit(batch(3, Category::Equities, 1)).await,
        Ok(DispatchOutcome::Queued)
    );
    assert_eq!(
        r.dispatcher.submit(batch(4, Category::Currency, 1)).await,
        Ok(DispatchOutcome::Queued)
    );
    assert_eq!(r.dispatcher.queue_len(), 2);
    assert!(r.dispatcher.pump().await.is_empty());

    let mut finished = Vec::new();
    while r.dispatcher.queue_len() > 0 {
        let wait = r.dispatcher.next_ready_in().unwrap();
        assert!(wait <= Duration::from_secs(31));
        r.clock.sleep(wait + Duration::from_millis(10)).await;
        for (id, res) in r.dispatcher.pump().await {
            assert!(matches!(res, Ok(DispatchOutcome::Delivered { .. })));
            finished.push(id);
        }
    }
    assert_eq!(finished, vec![3, 4]);
    assert_eq!(r.summarizer.calls(), 4);
    let order: Vec<_> = r.delivery.sent().into_iter().map(|(c, _)| c).collect();
    assert_eq!(
        order,
        vec![Category::Macro, Category::Crypto, Category::Equities, Category::Currency]
    );
}

#[tokio::test]
async fn queued_batch_expires_after_max_wait() {
    let cfg = DispatcherConfig {
        calls_per_minute: 1,
        max_queue_wait: Duration::from_secs(60),
        ..DispatcherConfig::default()
    };
    let mut r = rig(cfg, None, ScriptedSummarizer::new(MODEL));

    r.dispatcher.submit(batch(1, Category::Macro, 1)).await.unwrap();
    assert_eq!(
        r.dispatcher.submit(batch(2, Category::Macro, 3)).await,
        Ok(DispatchOutcome::Queued)
    );

    r.clock.advance(Duration::from_secs(61));
    let results = r.dispatcher.pump().await;
    assert_eq!(results, vec![(2, Err(DispatchError::QueueTimeout))]);
    assert_eq!(r.summarizer.calls(), 1);
    assert_eq!(r.dispatcher.queue_len(), 0);
    assert_eq!(r.sink.kinds(), vec!["queue_timeout"]);
    assert_eq!(r.dispatcher.monitor().stats().dropped_queue_timeout, 1);
}

#[tokio::test]
async fn full_queue_rejects_new_batches() {
    let cfg = DispatcherConfig {
        calls_per_minute: 1,
        max_queue_len: 1,
        ..DispatcherConfig::default()
    };
    let mut r = rig(cfg, None, ScriptedSummarizer::new(MODEL));

    r.dispatcher.submit(batch(1, Category::Macro, 1)).await.unwrap();
    assert_eq!(
        r.dispatcher.submit(batch(2, Category::Macro, 1)).await,
        Ok(DispatchOutcome::Queued)
    );
    assert_eq!(
        r.dispatcher.submit(batch(3, Category::Macro, 1)).await,
        Err(DispatchError::QueueFull)
    );
    assert_eq!(r.dispatcher.queue_len(), 1);
    assert_eq!(r.sink.kinds(), vec!["queue_full"]);
}

#[tokio::test]
async fn budget_running_out_drops_the_rest_of_the_queue() {
    let cfg = DispatcherConfig {
        calls_per_minute: 1,
        ..DispatcherConfig::default()
    };
    let mut r = rig(cfg, Some(0.01), ScriptedSummarizer::new(MODEL));

    r.dispatcher.submit(batch(1, Category::Macro, 1)).await.unwrap();
    r.dispatcher.submit(batch(2, Category::Macro, 1)).await.unwrap();
    r.dispatcher.submit(batch(3, Category::Macro, 1)).await.unwrap();
    assert_eq!(r.dispatcher.queue_len(), 2);

    r.clock.advance(Duration::from_secs(61));
    let first = r.dispatcher.pump().await;
    assert_eq!(first, vec![(2, Ok(DispatchOutcome::Delivered { parts: 1 }))]);

    r.clock.advance(Duration::from_secs(61));
    let second = r.dispatcher.pump().await;
    assert_eq!(second, vec![(3, Err(DispatchError::BudgetExhausted))]);
    assert_eq!(r.summarizer.calls(), 2);
}

#[tokio::test]
async fn rate_limited_call_pauses_and_resumes() {
    let summarizer = ScriptedSummarizer::new(MODEL).then(Err(
        finnews_digest::summarize::SummarizeError::RateLimited {
            retry_after: Some(Duration::from_secs(120)),
        },
    ));
    let mut r = rig(DispatcherConfig::default(), None, summarizer);

    assert_eq!(
        r.dispatcher.submit(batch(1, Category::Corporate, 2)).await,
        Ok(DispatchOutcome::Queued)
    );
    let wait = r.dispatcher.next_ready_in().unwrap();
    assert!(wait >= Duration::from_secs(119));
    assert!(r.dispatcher.pump().await.is_empty());

    r.clock.advance(wait + Duration::from_secs(1));
    let results = r.dispatcher.pump().await;
    assert_eq!(results, vec![(1, Ok(DispatchOutcome::Delivered { parts: 1 }))]);
    assert_eq!(r.summarizer.calls(), 2);
}

#[tokio::test]
async fn spend_is_persisted_for_the_day() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("budget.json");
    let summarizer = Arc::new(ScriptedSummarizer::new(MODEL));
    let sink = Arc::new(RecordingSink::default());
    let clock = clock();

    {
        let mut d = Dispatcher::new(
            DispatcherConfig::default(),
            summarizer.clone(),
            Arc::new(FlakyDelivery::reliable()),
            DailyBudget::load(&path, Some(1.0), t0()),
            clock.clone(),
            sink.clone(),
        );
        d.submit(batch(1, Category::Macro, 1)).await.unwrap();
    }

    let mut d = Dispatcher::new(
        DispatcherConfig::default(),
        summarizer,
        Arc::new(FlakyDelivery::reliable()),
        DailyBudget::load(&path, Some(1.0), clock.now()),
        clock,
        sink,
    );
    assert!((d.spent_today() - 0.006).abs() < 1e-9);
}
