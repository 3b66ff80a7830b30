//! Integration tests for the archive → publish pipeline.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;
use wayback_fanout::archiver::{Backends, Collect, Coordinator, Destination, Slot, SlotArchiver, Slots};
use wayback_fanout::pooling::{Pool, PoolError, PoolOptions, MSG_TIMEOUT};
use wayback_fanout::publish::{Dispatcher, Publisher, Publishers, Sink};
use wayback_fanout::reduxer::{Bundles, Capturer, Reduxer};
use wayback_fanout::service::{Outcome, Service};

struct Echo;

#[async_trait]
impl SlotArchiver for Echo {
    async fn wayback(&self, _token: &CancellationToken, url: &Url) -> Result<String> {
        Ok(format!("https://archive.example/{url}"))
    }
}

/// Always answers with the same snapshot URL.
struct Fixed(&'static str);

#[async_trait]
impl SlotArchiver for Fixed {
    async fn wayback(&self, _token: &CancellationToken, _url: &Url) -> Result<String> {
        Ok(self.0.to_string())
    }
}

/// Takes `delay` per call and counts calls.
struct Slow {
    delay: Duration,
    calls: AtomicUsize,
}

#[async_trait]
impl SlotArchiver for Slow {
    async fn wayback(&self, _token: &CancellationToken, url: &Url) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(format!("https://archive.example/{url}"))
    }
}

/// A capturer that never finishes within a test.
#[derive(Default)]
struct Hanging {
    shut_down: AtomicBool,
}

#[async_trait]
impl Capturer for Hanging {
    async fn html(&self, _url: &Url) -> Result<String> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok("<html></html>".to_string())
    }

    async fn screenshot(&self, _url: &Url) -> Result<Vec<u8>> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(vec![1])
    }

    async fn pdf(&self, _url: &Url) -> Result<Vec<u8>> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(vec![1])
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

struct Stuck;

#[async_trait]
impl SlotArchiver for Stuck {
    async fn wayback(&self, _token: &CancellationToken, _url: &Url) -> Result<String> {
        std::future::pending().await
    }
}

#[derive(Default)]
struct Recorder {
    sources: Mutex<Vec<String>>,
}

impl Recorder {
    fn sources(&self) -> Vec<String> {
        self.sources.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for Recorder {
    async fn publish(&self, _token: &CancellationToken, _bundles: &Bundles, cols: &[Collect]) -> Result<()> {
        self.sources.lock().unwrap().push(cols[0].src.clone());
        Ok(())
    }
}

fn backends(archiver: Arc<dyn SlotArchiver>) -> Backends {
    Backends::new(archiver.clone(), archiver.clone(), archiver.clone(), archiver)
}

fn slots() -> Slots {
    [Slot::Ia, Slot::Is].into_iter().collect()
}

fn service(backends: Backends, publishers: Publishers, timeout: Duration) -> (Service, CancellationToken) {
    let coordinator = Coordinator::new(backends, Duration::from_secs(60));
    service_with(coordinator, publishers, PoolOptions::new(2, timeout, 1))
}

fn service_with(
    coordinator: Coordinator,
    publishers: Publishers,
    options: PoolOptions,
) -> (Service, CancellationToken) {
    let root = CancellationToken::new();
    let options = options.with_backoff(Duration::ZERO);
    let pool = Pool::new(root.clone(), options.clone()).unwrap();
    let publish_pool = Pool::new(root.clone(), options).unwrap();

    let service = Service::new(coordinator, pool, Dispatcher::new(publish_pool, publishers), slots());
    service.start();
    (service, root)
}

fn urls(list: &[&str]) -> Vec<Url> {
    list.iter().map(|u| Url::parse(u).unwrap()).collect()
}

#[tokio::test]
async fn test_archive_then_spread_to_every_sink() {
    const IA: &str = "https://web.archive.org/web/20240101000000/https://example.com/";
    const IS: &str = "http://archive.today/abcdE";

    let stuck: Arc<dyn SlotArchiver> = Arc::new(Stuck);
    let backends = Backends::new(Arc::new(Fixed(IA)), Arc::new(Fixed(IS)), stuck.clone(), stuck);
    let coordinator = Coordinator::new(backends, Duration::from_secs(5));

    let root = CancellationToken::new();
    let archived = coordinator
        .archive(&root, &urls(&["https://example.com/"]), &slots())
        .await
        .unwrap();

    let mut collects = archived.collects.clone();
    collects.sort_by_key(|col| col.slot);
    assert_eq!(
        collects,
        vec![
            Collect::new(Slot::Ia, "https://example.com/", Destination::Archived(IA.to_string())),
            Collect::new(Slot::Is, "https://example.com/", Destination::Archived(IS.to_string())),
        ]
    );

    let chat = Arc::new(Recorder::default());
    let index = Arc::new(Recorder::default());
    let publishers = Publishers::default()
        .with(Sink::Chat, chat.clone())
        .with(Sink::SearchIndex, index.clone());
    let options = PoolOptions::new(2, Duration::from_secs(5), 0);
    let dispatcher = Dispatcher::new(Pool::new(root.clone(), options).unwrap(), publishers);
    let pool = dispatcher.pool().clone();
    tokio::spawn(async move { pool.roll().await });

    let submitted = dispatcher
        .spread(&root, &archived.bundles, &archived.collects, &[Sink::Chat, Sink::SearchIndex])
        .await;
    assert_eq!(submitted, 2);

    tokio::time::timeout(Duration::from_secs(5), async {
        while dispatcher.waiting() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("publish jobs still waiting");
    assert!(!dispatcher.pool().closed());

    assert_eq!(chat.sources(), vec!["https://example.com/".to_string()]);
    assert_eq!(index.sources(), vec!["https://example.com/".to_string()]);
    assert_eq!(dispatcher.stats(Sink::Chat).success, 1);
    assert_eq!(dispatcher.stats(Sink::SearchIndex).success, 1);
    assert_eq!(dispatcher.stats(Sink::Issue).request, 0);

    dispatcher.pool().close().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_capture_keeps_finished_records() {
    let slow = Arc::new(Slow {
        delay: Duration::from_millis(600),
        calls: AtomicUsize::new(0),
    });
    let capturer = Arc::new(Hanging::default());
    let dir = tempfile::tempdir().unwrap();
    let reduxer = Reduxer::new(dir.path(), Duration::from_secs(2), capturer.clone());
    let coordinator =
        Coordinator::new(backends(slow.clone()), Duration::from_secs(1)).with_reduxer(Arc::new(reduxer));
    let (service, _root) = service_with(
        coordinator,
        Publishers::default(),
        PoolOptions::new(2, Duration::from_secs(1), 2),
    );

    let rx = service.submit(urls(&["https://a.example/"])).await.unwrap();

    let Outcome::Archived(collects) = rx.await.unwrap() else {
        panic!("expected records");
    };
    assert_eq!(collects.len(), 2);
    assert!(collects.iter().all(Collect::is_archived));
    // One call per slot, no retry
    assert_eq!(slow.calls.load(Ordering::SeqCst), 2);

    service.close().await;
    assert!(capturer.shut_down.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_submit_delivers_records() {
    let (service, _root) = service(backends(Arc::new(Echo)), Publishers::default(), Duration::from_secs(5));

    let rx = service
        .submit(urls(&["https://a.example/", "https://b.example/"]))
        .await
        .unwrap();

    let Outcome::Archived(collects) = rx.await.unwrap() else {
        panic!("expected records");
    };
    assert_eq!(collects.len(), 4);
    service.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_submit_falls_back_after_retries() {
    let (service, _root) = service(backends(Arc::new(Stuck)), Publishers::default(), Duration::from_secs(1));

    let rx = service.submit(urls(&["https://a.example/"])).await.unwrap();

    assert_eq!(rx.await.unwrap(), Outcome::Failed(MSG_TIMEOUT.to_string()));
    service.close().await;
    assert_eq!(service.pool().waiting(), 0);
}

#[tokio::test]
async fn test_submit_after_close_is_refused() {
    let (service, _root) = service(backends(Arc::new(Echo)), Publishers::default(), Duration::from_secs(5));
    service.close().await;

    let err = service.submit(urls(&["https://a.example/"])).await.unwrap_err();
    assert!(matches!(err, PoolError::Closed));
}
