use refresh_cache::{BoxError, KeyedCache, ValueCache};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const REFRESH_INTERVAL_MS: u64 = 200;
const LOAD_DELAY_MS: u64 = 100;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "debug".into()))
        .init();

    let loads = Arc::new(AtomicUsize::new(0));
    let loads_clone = loads.clone();

    let cache = Arc::new(
        KeyedCache::builder()
            .refresh_interval(Duration::from_millis(REFRESH_INTERVAL_MS))
            .retrieve(move |key: i32| {
                let n = loads_clone.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    tokio::time::sleep(Duration::from_millis(LOAD_DELAY_MS)).await;
                    if key < 0 {
                        return Err(format!("no value for key {}", key));
                    }
                    Ok(format!("Value for key {} (load #{})", key, n))
                }
            })
            .on_background_failure(|error| println!("Background refresh failed: {}", error))
            .build()?,
    );

    println!("Loading value for key 1 from five callers at once...");
    let callers: Vec<_> = (0..5)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(1).await })
        })
        .collect();
    for caller in callers {
        println!("Got: {}", caller.await??);
    }
    println!("Upstream loads so far: {}", loads.load(Ordering::SeqCst));

    println!("Loading value for key 1 again (should be cached)...");
    println!("Got: {}", cache.get(1).await?);

    match cache.get(-1).await {
        Ok(value) => println!("Unexpected value: {}", value),
        Err(error) => println!("Key -1 failed: {}", error),
    }
    println!("Known keys: {:?}", cache.keys());

    println!("Waiting for a background refresh...");
    tokio::time::sleep(Duration::from_millis(REFRESH_INTERVAL_MS + 2 * LOAD_DELAY_MS)).await;
    println!("Got: {}", cache.get(1).await?);

    cache.dispose();

    let single = ValueCache::builder()
        .refresh_interval(Duration::from_secs(300))
        .retrieve(|| async { Ok::<_, BoxError>("single value") })
        .build()?;
    println!("Single value: {}", single.get_value().await?);

    Ok(())
}
