//! Integration tests for the fan-out coordinator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;
use wayback_fanout::archiver::{
    ArchiveError, Backends, Coordinator, Destination, Slot, SlotArchiver, Slots,
};

#[derive(Clone, Copy)]
enum Behavior {
    Archive,
    Fail,
    Panic,
    Hang,
}

struct FakeArchiver {
    slot: Slot,
    delay: Duration,
    behavior: Behavior,
}

#[async_trait]
impl SlotArchiver for FakeArchiver {
    async fn wayback(&self, _token: &CancellationToken, url: &Url) -> Result<String> {
        tokio::time::sleep(self.delay).await;
        match self.behavior {
            Behavior::Archive => Ok(format!("https://{}.example/{}", self.slot, url.path().trim_start_matches('/'))),
            Behavior::Fail => anyhow::bail!("service unavailable"),
            Behavior::Panic => panic!("archiver bug"),
            Behavior::Hang => std::future::pending().await,
        }
    }

    async fn playback(&self, _token: &CancellationToken, url: &Url) -> Result<Option<String>> {
        Ok(matches!(self.slot, Slot::Ia).then(|| format!("https://ia.example/{url}")))
    }
}

fn fake(slot: Slot, behavior: Behavior) -> Arc<dyn SlotArchiver> {
    Arc::new(FakeArchiver {
        slot,
        delay: Duration::from_millis(10),
        behavior,
    })
}

fn coordinator(ia: Behavior, is: Behavior, ip: Behavior, ph: Behavior) -> Coordinator {
    let backends = Backends::new(
        fake(Slot::Ia, ia),
        fake(Slot::Is, is),
        fake(Slot::Ip, ip),
        fake(Slot::Ph, ph),
    );
    Coordinator::new(backends, Duration::from_secs(10))
}

fn healthy() -> Coordinator {
    coordinator(Behavior::Archive, Behavior::Archive, Behavior::Archive, Behavior::Archive)
}

fn slots(list: &[Slot]) -> Slots {
    list.iter().copied().collect()
}

fn urls(list: &[&str]) -> Vec<Url> {
    list.iter().map(|u| Url::parse(u).unwrap()).collect()
}

#[tokio::test]
async fn test_one_record_per_url_and_slot() {
    let archived = healthy()
        .archive(
            &CancellationToken::new(),
            &urls(&["https://a.example/x", "https://b.example/y"]),
            &slots(&Slot::ALL),
        )
        .await
        .unwrap();

    assert_eq!(archived.collects.len(), 8);
    for slot in Slot::ALL {
        assert_eq!(archived.collects.iter().filter(|c| c.slot == slot).count(), 2);
    }
    assert!(archived.collects.iter().all(|c| c.is_archived()));
    assert!(archived.bundles.is_empty());
}

#[tokio::test]
async fn test_duplicate_urls_archived_once() {
    let archived = healthy()
        .archive(
            &CancellationToken::new(),
            &urls(&["https://a.example/x", "https://a.example/x"]),
            &slots(&[Slot::Ia, Slot::Is]),
        )
        .await
        .unwrap();

    assert_eq!(archived.collects.len(), 2);
}

#[tokio::test]
async fn test_failures_are_recorded_not_dropped() {
    let coordinator = coordinator(Behavior::Archive, Behavior::Fail, Behavior::Panic, Behavior::Archive);
    let archived = coordinator
        .archive(&CancellationToken::new(), &urls(&["https://a.example/x"]), &slots(&Slot::ALL))
        .await
        .unwrap();

    assert_eq!(archived.collects.len(), 4);
    let dst = |slot: Slot| {
        archived
            .collects
            .iter()
            .find(|c| c.slot == slot)
            .map(|c| c.dst.clone())
            .unwrap()
    };
    assert_eq!(dst(Slot::Ia), Destination::Archived("https://ia.example/x".into()));
    assert_eq!(dst(Slot::Is), Destination::Failed("service unavailable".into()));
    assert_eq!(dst(Slot::Ip), Destination::Failed("archiver panicked".into()));
    assert!(dst(Slot::Ph).is_archived());
}

#[tokio::test]
async fn test_rejects_empty_input() {
    let token = CancellationToken::new();
    let err = healthy()
        .archive(&token, &[], &slots(&Slot::ALL))
        .await
        .unwrap_err();
    assert!(matches!(err, ArchiveError::NoUrls));

    let err = healthy()
        .archive(&token, &urls(&["https://a.example/"]), &Slots::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ArchiveError::NoSlotEnabled));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_returns_partial_records() {
    let coordinator = coordinator(Behavior::Archive, Behavior::Hang, Behavior::Hang, Behavior::Hang);
    let token = CancellationToken::new();

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        canceller.cancel();
    });

    let err = coordinator
        .archive(&token, &urls(&["https://a.example/x"]), &slots(&Slot::ALL))
        .await
        .unwrap_err();

    let ArchiveError::Cancelled { partial } = err else {
        panic!("expected cancellation, got {err:?}");
    };
    assert_eq!(partial.len(), 1);
    assert_eq!(partial[0].slot, Slot::Ia);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_returns_partial_records() {
    let coordinator = coordinator(Behavior::Archive, Behavior::Archive, Behavior::Hang, Behavior::Fail);

    let err = coordinator
        .archive(&CancellationToken::new(), &urls(&["https://a.example/x"]), &slots(&Slot::ALL))
        .await
        .unwrap_err();

    assert!(matches!(err, ArchiveError::DeadlineExceeded { .. }));
    let partial = err.partial();
    assert_eq!(partial.len(), 3);
    assert!(partial.iter().all(|c| c.slot != Slot::Ip));
}

#[tokio::test]
async fn test_playback_queries_every_slot() {
    let collects = healthy()
        .playback(&CancellationToken::new(), &urls(&["https://a.example/x"]))
        .await
        .unwrap();

    assert_eq!(collects.len(), Slot::ALL.len());
    let found: Vec<_> = collects.iter().filter(|c| c.is_archived()).collect();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].slot, Slot::Ia);
    assert!(collects
        .iter()
        .filter(|c| c.slot != Slot::Ia)
        .all(|c| c.dst == Destination::Failed("no snapshot found".into())));
}
