use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use hdrhistogram::Histogram;
use shot_guard::ControlBehavior;
use shot_guard::DegradeRule;
use shot_guard::Engine;
use shot_guard::EngineConfig;
use shot_guard::FlowRule;
use shot_guard::Rule;
use tokio::sync::Barrier;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceExt;
use tower::service_fn;
use tower_guard::GuardLayer;
use tower_guard::RejectError;
use tower_guard::make_guarded_svc;
use tracing_subscriber::EnvFilter;

async fn mock_db_call(_req: ()) -> Result<&'static str, BoxError> {
    // Simulate real-world work (50ms of DB latency)
    sleep(Duration::from_millis(50)).await;
    Ok("success")
}

#[derive(Default)]
struct RejectionCounter {
    rate_limited: usize,
    degraded: usize,
    forbidden: usize,
    timeouts: usize,
    unknown: usize,
}

async fn run_load_test<S>(name: &str, svc: S, total_reqs: usize) -> Result<(), BoxError>
where
    S: Service<(), Response = &'static str, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send,
{
    let mut hist_elapsed = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3)?;
    let mut tasks = JoinSet::new();
    let mut rejections = RejectionCounter::default();

    let start = Instant::now();
    let barrier = Arc::new(Barrier::new(total_reqs));

    for _ in 0..total_reqs {
        let local_svc = svc.clone();
        let bar = barrier.clone();
        tasks.spawn(async move {
            bar.wait().await;
            let req_start = Instant::now();
            let res = local_svc.oneshot(()).await;
            (res, req_start.elapsed())
        });
    }

    let mut success_count = 0;
    while let Some(task) = tasks.join_next().await {
        let (res, elapsed) = task?;
        match res {
            Ok(_) => {
                success_count += 1;
                hist_elapsed.record(elapsed.as_micros() as u64)?;
            }
            Err(e) => {
                if let Some(reject) = e.downcast_ref::<RejectError>() {
                    match reject {
                        RejectError::RateLimited(_) => rejections.rate_limited += 1,
                        RejectError::Degraded { .. } => rejections.degraded += 1,
                        RejectError::Forbidden(_) => rejections.forbidden += 1,
                    }
                } else if e.is::<tower::timeout::error::Elapsed>() {
                    rejections.timeouts += 1;
                } else {
                    rejections.unknown += 1;
                }
            }
        }
    }

    let total_duration = start.elapsed();
    let throughput = total_reqs as f64 / total_duration.as_secs_f64();
    let goodput = success_count as f64 / total_duration.as_secs_f64();

    println!("--- {} ---", name);
    println!("Total Duration:  {:.2?}", total_duration);
    println!("Success/Total:   {}/{}", success_count, total_reqs);
    println!("Total Rate:      {:.2} req/sec", throughput);
    println!("Success Rate:    {:.2} req/sec (Goodput)", goodput);

    if success_count > 0 {
        println!("P50 (Elapsed):   {}µs", hist_elapsed.value_at_quantile(0.5));
        println!(
            "P99 (Elapsed):   {}µs",
            hist_elapsed.value_at_quantile(0.99)
        );
    }

    let total_errors = rejections.rate_limited
        + rejections.degraded
        + rejections.forbidden
        + rejections.timeouts
        + rejections.unknown;
    println!("Errors:          {}", total_errors);
    if total_errors > 0 {
        println!("  └─ RateLimited: {}", rejections.rate_limited);
        println!("  └─ Degraded:    {}", rejections.degraded);
        println!("  └─ Timeouts:    {}", rejections.timeouts);
        if rejections.forbidden > 0 {
            println!("  └─ Forbidden:   {}", rejections.forbidden);
        }
        if rejections.unknown > 0 {
            println!("  └─ Unknown:     {}", rejections.unknown);
        }
    }
    println!();
    Ok(())
}

fn engine_with(rules: Vec<Rule>) -> Result<Engine, BoxError> {
    let engine = Engine::new(EngineConfig::default())?;
    engine.load_rules(rules)?;
    Ok(engine)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let threshold = 10_000.0;
    let timeout = Duration::from_millis(550);
    let total_reqs = 50_000;

    // 1. Reject above the threshold
    let engine = engine_with(vec![FlowRule::qps("db", threshold).into()])?;
    let svc = GuardLayer::new(engine, "db").layer(service_fn(mock_db_call));
    run_load_test("Direct Reject", svc, total_reqs).await?;

    // 2. Warm up from a third of the threshold
    let engine = engine_with(vec![
        FlowRule::qps("db", threshold)
            .with_control_behavior(ControlBehavior::WarmUp)
            .with_warm_up_period_sec(10)
            .into(),
    ])?;
    let svc = GuardLayer::new(engine, "db").layer(service_fn(mock_db_call));
    run_load_test("Warm Up", svc, total_reqs).await?;

    // 3. Queue requests at a uniform pace, bounded by the timeout
    let engine = engine_with(vec![
        FlowRule::qps("db", threshold)
            .with_control_behavior(ControlBehavior::RateLimiter)
            .with_max_queueing_time_ms(500)
            .into(),
    ])?;
    let svc = make_guarded_svc(engine, "db", timeout, service_fn(mock_db_call));
    run_load_test("Rate Limiter (Queued)", svc, total_reqs).await?;

    // 4. Concurrency limit with a slow-call breaker behind it
    let engine = engine_with(vec![
        FlowRule::concurrency("db", 1_000.0).into(),
        DegradeRule::rt("db", 40.0, 5).into(),
    ])?;
    let svc = GuardLayer::new(engine, "db").layer(service_fn(mock_db_call));
    run_load_test("Concurrency + Breaker", svc, total_reqs).await?;

    Ok(())
}
