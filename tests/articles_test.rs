mod common;

use chrono::{TimeZone, Utc};
use common::{Fakes, GateFetcher, RecordingFetcher, RecordingSurface};
use peakdip_offline::articles::{
    ArticleNotifier, ArticleNotifierConfig, ClickTarget, Delivery, EnableOutcome, PollOutcome,
};
use peakdip_offline::capabilities::{Permission, ToastLevel};
use peakdip_offline::clock::FixedClock;
use peakdip_offline::fetch::FetchError;
use peakdip_offline::model::{CacheMode, NotificationData, Response};
use peakdip_offline::storage::{keys, KeyValueStore, MemoryStore};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;

const META: &str = "https://bitcoinpeakdip.com/learn/data/articles.json";

fn config() -> ArticleNotifierConfig {
    ArticleNotifierConfig {
        site_url: Url::parse("https://bitcoinpeakdip.com/").unwrap(),
        metadata_url: Url::parse(META).unwrap(),
        check_interval: Duration::from_secs(30 * 60),
        new_article_days: 7,
        cache_ttl: Duration::from_secs(3600),
        fetch_timeout: Duration::from_secs(5),
        debounce: Duration::from_secs(1),
    }
}

fn clock_at(y: i32, m: u32, d: u32) -> Arc<FixedClock> {
    Arc::new(FixedClock::new(Utc.with_ymd_and_hms(y, m, d, 10, 0, 0).unwrap()))
}

fn metadata(articles: &[(&str, &str)]) -> Response {
    let list: Vec<_> = articles
        .iter()
        .map(|(id, date)| {
            serde_json::json!({
                "id": id,
                "title": format!("Article {id}"),
                "slug": format!("article-{id}"),
                "date": date,
                "reading_time": 6,
                "level": "Beginner"
            })
        })
        .collect();
    Response::ok(serde_json::to_vec(&serde_json::json!({ "articles": list })).unwrap())
}

struct Setup {
    notifier: Arc<ArticleNotifier>,
    network: RecordingFetcher,
    store: Arc<MemoryStore>,
    clock: Arc<FixedClock>,
    fakes: Fakes,
}

fn setup_with(
    store: Arc<MemoryStore>,
    clock: Arc<FixedClock>,
    fakes: Fakes,
    permission: Permission,
) -> Setup {
    let network = RecordingFetcher::new();
    let notifier = Arc::new(ArticleNotifier::new(
        config(),
        Arc::new(network.clone()),
        store.clone(),
        fakes.capabilities(permission),
        clock.clone(),
    ));
    Setup {
        notifier,
        network,
        store,
        clock,
        fakes,
    }
}

fn setup(permission: Permission) -> Setup {
    setup_with(
        Arc::new(MemoryStore::new()),
        clock_at(2026, 2, 12),
        Fakes::new(),
        permission,
    )
}

async fn force_enabled(store: &MemoryStore) {
    store.set_item(keys::NOTIFICATIONS_ENABLED, "true").await.unwrap();
}

#[tokio::test]
async fn recent_article_is_new_until_it_ages_out() {
    let s = setup(Permission::Granted);
    force_enabled(&s.store).await;
    s.network.set(META, Ok(metadata(&[("a1", "2026-02-10")]))).await;

    let outcome = s.notifier.check_for_new_articles(true).await;
    assert_eq!(
        outcome,
        PollOutcome::Notified {
            ids: vec!["a1".into()],
            via: Delivery::Delegated
        }
    );
    let shown = s.fakes.delegated.shown().await;
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].tag, "article-a1");
    assert!(shown[0].require_interaction);
    assert_eq!(shown[0].data.url, "https://bitcoinpeakdip.com/learn/article-a1.html");
    assert!(shown[0].body.contains("6 min read"));

    let later = setup_with(
        Arc::new(MemoryStore::new()),
        clock_at(2026, 2, 25),
        Fakes::new(),
        Permission::Granted,
    );
    force_enabled(&later.store).await;
    later.network.set(META, Ok(metadata(&[("a1", "2026-02-10")]))).await;
    assert_eq!(later.notifier.check_for_new_articles(true).await, PollOutcome::NothingNew);
}

#[tokio::test]
async fn notified_article_is_never_announced_again_after_reload() {
    let s = setup(Permission::Granted);
    force_enabled(&s.store).await;
    s.network.set(META, Ok(metadata(&[("a1", "2026-02-10")]))).await;
    assert!(matches!(
        s.notifier.check_for_new_articles(true).await,
        PollOutcome::Notified { .. }
    ));

    // Evict the article cache and "reload the page" with a new instance.
    s.store.remove_item(keys::ARTICLES_CACHE).await.unwrap();
    s.store.remove_item(keys::ARTICLES_CACHE_TIME).await.unwrap();
    let reloaded = setup_with(s.store.clone(), s.clock.clone(), Fakes::new(), Permission::Granted);
    reloaded.network.set(META, Ok(metadata(&[("a1", "2026-02-10")]))).await;

    assert_eq!(reloaded.notifier.check_for_new_articles(true).await, PollOutcome::NothingNew);
    assert!(reloaded.fakes.delegated.shown().await.is_empty());
    assert_eq!(reloaded.notifier.notified_ids().await, vec!["a1".to_string()]);
}

#[tokio::test]
async fn first_opt_in_marks_existing_articles_silently() {
    let s = setup(Permission::Granted);
    s.network
        .push(META, Ok(metadata(&[("a1", "2026-02-10"), ("a2", "2026-02-11")])))
        .await;

    assert_eq!(s.notifier.enable().await.unwrap(), EnableOutcome::Enabled);
    assert!(s.notifier.is_enabled().await);
    assert!(s.fakes.delegated.shown().await.is_empty());
    assert_eq!(s.notifier.notified_ids().await, vec!["a1".to_string(), "a2".to_string()]);
    assert!(s.notifier.status().await.polling);
    let toasts = s.fakes.ui.toasts().await;
    assert_eq!(toasts.len(), 1);
    assert_eq!(toasts[0].1, ToastLevel::Success);

    s.network
        .set(META, Ok(metadata(&[("a1", "2026-02-10"), ("a2", "2026-02-11"), ("a3", "2026-02-12")])))
        .await;
    assert_eq!(
        s.notifier.check_for_new_articles(true).await,
        PollOutcome::Notified {
            ids: vec!["a3".into()],
            via: Delivery::Delegated
        }
    );
    s.notifier.stop_polling().await;
}

#[tokio::test]
async fn denied_permission_warns_once_and_stays_disabled() {
    let s = setup(Permission::Denied);
    assert_eq!(s.notifier.enable().await.unwrap(), EnableOutcome::Denied);
    s.clock.advance(chrono::Duration::seconds(5));
    assert_eq!(s.notifier.enable().await.unwrap(), EnableOutcome::Denied);

    assert!(!s.notifier.is_enabled().await);
    let toasts = s.fakes.ui.toasts().await;
    assert_eq!(toasts.len(), 1);
    assert_eq!(toasts[0].1, ToastLevel::Warning);
    assert!(s.network.calls().await.is_empty());
}

#[tokio::test]
async fn rapid_toggles_are_debounced() {
    let s = setup(Permission::Granted);
    s.network.set(META, Ok(metadata(&[]))).await;

    assert_eq!(s.notifier.enable().await.unwrap(), EnableOutcome::Enabled);
    assert_eq!(s.notifier.enable().await.unwrap(), EnableOutcome::Debounced);
    assert!(s.notifier.is_enabled().await);

    // Turning off right after turning on is not a duplicate.
    assert!(s.notifier.disable().await.unwrap());
    assert!(!s.notifier.disable().await.unwrap());
    assert!(!s.notifier.is_enabled().await);
    assert!(!s.notifier.status().await.polling);
    assert_eq!(
        s.store.get_item(keys::NOTIFICATIONS_ENABLED).await.unwrap().as_deref(),
        Some("false")
    );

    s.clock.advance(chrono::Duration::seconds(2));
    assert_eq!(s.notifier.enable().await.unwrap(), EnableOutcome::Enabled);
    s.clock.advance(chrono::Duration::seconds(2));
    assert_eq!(s.notifier.enable().await.unwrap(), EnableOutcome::AlreadyEnabled);
    s.notifier.stop_polling().await;
}

#[tokio::test]
async fn disabled_notifier_does_not_poll() {
    let s = setup(Permission::Granted);
    assert_eq!(s.notifier.check_for_new_articles(true).await, PollOutcome::Disabled);
    assert!(s.network.calls().await.is_empty());
}

#[tokio::test]
async fn delegation_failure_falls_back_to_direct_notification() {
    let mut fakes = Fakes::new();
    fakes.delegated = RecordingSurface::failing();
    let s = setup_with(Arc::new(MemoryStore::new()), clock_at(2026, 2, 12), fakes, Permission::Granted);
    force_enabled(&s.store).await;
    s.network.set(META, Ok(metadata(&[("a1", "2026-02-10")]))).await;

    assert_eq!(
        s.notifier.check_for_new_articles(true).await,
        PollOutcome::Notified {
            ids: vec!["a1".into()],
            via: Delivery::Direct
        }
    );
    let direct = s.fakes.direct.shown().await;
    assert_eq!(direct.len(), 1);
    assert!(direct[0].actions.is_empty());
    assert_eq!(direct[0].body, "Article a1");
    assert_eq!(s.notifier.notified_ids().await, vec!["a1".to_string()]);
}

#[tokio::test]
async fn undelivered_articles_stay_eligible() {
    let mut fakes = Fakes::new();
    fakes.delegated = RecordingSurface::failing();
    fakes.direct = RecordingSurface::failing();
    let s = setup_with(Arc::new(MemoryStore::new()), clock_at(2026, 2, 12), fakes, Permission::Granted);
    force_enabled(&s.store).await;
    s.network.set(META, Ok(metadata(&[("a1", "2026-02-10")]))).await;

    assert_eq!(
        s.notifier.check_for_new_articles(true).await,
        PollOutcome::Undelivered {
            ids: vec!["a1".into()]
        }
    );
    assert!(s.notifier.notified_ids().await.is_empty());
}

#[tokio::test]
async fn several_new_articles_produce_one_digest() {
    let s = setup(Permission::Granted);
    force_enabled(&s.store).await;
    s.network
        .set(
            META,
            Ok(metadata(&[
                ("a1", "2026-02-08"),
                ("a2", "2026-02-09"),
                ("a3", "2026-02-10"),
                ("a4", "2026-02-11"),
                ("old", "2025-12-01"),
            ])),
        )
        .await;

    let outcome = s.notifier.check_for_new_articles(true).await;
    let PollOutcome::Notified { ids, .. } = outcome else {
        panic!("expected a notification, got {outcome:?}");
    };
    assert_eq!(ids.len(), 4);

    let shown = s.fakes.delegated.shown().await;
    assert_eq!(shown.len(), 1);
    let digest = &shown[0];
    assert_eq!(digest.tag, "peakdip-new-articles");
    assert!(digest.title.starts_with("4 new articles"));
    assert!(digest.body.contains("…and 1 more"));
    assert_eq!(digest.data.url, "https://bitcoinpeakdip.com/learn/");
    assert_eq!(digest.data.article_ids.len(), 4);
    assert_eq!(digest.actions[0].action, "view-all");
}

#[tokio::test]
async fn metadata_is_cached_for_the_freshness_window() {
    let s = setup(Permission::Granted);
    s.network.set(META, Ok(metadata(&[("a1", "2026-02-10")]))).await;

    assert_eq!(s.notifier.load_articles(false).await.len(), 1);
    assert_eq!(s.notifier.load_articles(false).await.len(), 1);
    assert_eq!(s.network.calls_to(META).await, 1);

    s.clock.advance(chrono::Duration::hours(2));
    s.notifier.load_articles(false).await;
    assert_eq!(s.network.calls_to(META).await, 2);

    s.notifier.load_articles(true).await;
    assert_eq!(s.network.calls_to(META).await, 3);

    let call = s.network.calls().await.pop().unwrap();
    assert_eq!(call.cache, CacheMode::NoStore);
    assert!(call.url.query_pairs().any(|(k, _)| k == "t"));
}

#[tokio::test]
async fn metadata_failures_fall_back_silently() {
    let s = setup(Permission::Granted);
    assert!(s.notifier.load_articles(true).await.is_empty());

    s.network.push(META, Ok(metadata(&[("a1", "2026-02-10")]))).await;
    s.network.push(META, Ok(Response::new(500, "boom"))).await;
    s.network.push(META, Err(FetchError::Network("offline".into()))).await;

    assert_eq!(s.notifier.load_articles(true).await.len(), 1);
    assert_eq!(s.notifier.load_articles(true).await.len(), 1);
    assert_eq!(s.notifier.load_articles(true).await.len(), 1);
    assert!(s.fakes.ui.toasts().await.is_empty());
}

#[tokio::test]
async fn missing_articles_field_is_an_empty_list() {
    let s = setup(Permission::Granted);
    s.network.set(META, Ok(Response::ok(r#"{"updated":"2026-02-12"}"#))).await;
    assert!(s.notifier.load_articles(true).await.is_empty());
}

fn gated(
    config: ArticleNotifierConfig,
    store: Arc<MemoryStore>,
    fakes: &Fakes,
    clock: Arc<FixedClock>,
) -> (Arc<ArticleNotifier>, GateFetcher) {
    let gate = GateFetcher::new(metadata(&[("a1", "2026-02-10")]));
    let notifier = Arc::new(ArticleNotifier::new(
        config,
        Arc::new(gate.clone()),
        store,
        fakes.capabilities(Permission::Granted),
        clock,
    ));
    (notifier, gate)
}

#[tokio::test]
async fn overlapping_poll_cycles_are_skipped() {
    let store = Arc::new(MemoryStore::new());
    force_enabled(&store).await;
    let fakes = Fakes::new();
    let (notifier, gate) = gated(config(), store, &fakes, clock_at(2026, 2, 12));

    let running = {
        let n = notifier.clone();
        tokio::spawn(async move { n.check_for_new_articles(true).await })
    };
    gate.entered().await;
    assert_eq!(notifier.check_for_new_articles(true).await, PollOutcome::AlreadyRunning);

    gate.open();
    assert!(matches!(running.await.unwrap(), PollOutcome::Notified { .. }));
    assert_eq!(fakes.delegated.shown().await.len(), 1);
}

#[tokio::test]
async fn aborted_cycle_does_not_block_later_checks() {
    let store = Arc::new(MemoryStore::new());
    force_enabled(&store).await;
    let fakes = Fakes::new();
    let (notifier, gate) = gated(config(), store, &fakes, clock_at(2026, 2, 12));

    let running = {
        let n = notifier.clone();
        tokio::spawn(async move { n.check_for_new_articles(true).await })
    };
    gate.entered().await;
    running.abort();
    assert!(running.await.unwrap_err().is_cancelled());

    gate.open();
    assert_eq!(
        notifier.check_for_new_articles(true).await,
        PollOutcome::Notified {
            ids: vec!["a1".into()],
            via: Delivery::Delegated
        }
    );
}

#[tokio::test]
async fn disable_mid_poll_then_reenable_keeps_delivering() {
    let store = Arc::new(MemoryStore::new());
    // Not a first opt-in, so enabling does not fetch.
    store.set_item(keys::NOTIFIED_ARTICLES, "[]").await.unwrap();
    let fakes = Fakes::new();
    let clock = clock_at(2026, 2, 12);
    let fast = ArticleNotifierConfig {
        check_interval: Duration::from_millis(20),
        ..config()
    };
    let (notifier, gate) = gated(fast, store, &fakes, clock.clone());

    assert_eq!(notifier.enable().await.unwrap(), EnableOutcome::Enabled);
    gate.entered().await;
    clock.advance(chrono::Duration::seconds(2));
    assert!(notifier.disable().await.unwrap());
    assert!(!notifier.status().await.polling);

    gate.open();
    clock.advance(chrono::Duration::seconds(2));
    assert_eq!(notifier.enable().await.unwrap(), EnableOutcome::Enabled);
    for _ in 0..250 {
        if !fakes.delegated.shown().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    notifier.stop_polling().await;

    let shown = fakes.delegated.shown().await;
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].tag, "article-a1");
}

#[tokio::test]
async fn revoked_permission_clears_stale_enabled_flag() {
    let s = setup(Permission::Denied);
    force_enabled(&s.store).await;

    assert_eq!(s.notifier.enable().await.unwrap(), EnableOutcome::Denied);
    assert!(!s.notifier.is_enabled().await);
    assert!(!s.notifier.init().await);
    assert_eq!(s.fakes.ui.toasts().await.len(), 1);
}

#[tokio::test]
async fn init_resumes_polling_only_when_enabled_and_permitted() {
    let s = setup(Permission::Granted);
    assert!(!s.notifier.init().await);
    force_enabled(&s.store).await;
    assert!(s.notifier.init().await);
    s.notifier.stop_polling().await;

    let denied = setup_with(s.store.clone(), s.clock.clone(), Fakes::new(), Permission::Denied);
    assert!(!denied.notifier.init().await);
}

#[tokio::test]
async fn clicks_route_to_article_or_list() {
    let s = setup(Permission::Granted);
    let data = NotificationData {
        url: "https://bitcoinpeakdip.com/learn/article-a1.html".into(),
        article_ids: vec!["a1".into()],
    };
    assert_eq!(
        s.notifier.notification_click(Some("read"), &data),
        ClickTarget::Article(data.url.clone())
    );
    assert_eq!(s.notifier.notification_click(None, &data), ClickTarget::Article(data.url.clone()));
    assert_eq!(
        s.notifier.notification_click(Some("view-all"), &data),
        ClickTarget::List("https://bitcoinpeakdip.com/learn/".into())
    );
    assert_eq!(s.notifier.notification_click(Some("dismiss"), &data), ClickTarget::Dismiss);
    assert_eq!(
        s.notifier.notification_click(None, &NotificationData::default()),
        ClickTarget::List("https://bitcoinpeakdip.com/learn/".into())
    );
}

#[tokio::test]
async fn reset_makes_articles_eligible_again() {
    let s = setup(Permission::Granted);
    force_enabled(&s.store).await;
    s.network.set(META, Ok(metadata(&[("a1", "2026-02-10")]))).await;
    s.notifier.check_for_new_articles(true).await;
    s.notifier.reset_notified().await.unwrap();
    assert!(matches!(
        s.notifier.check_for_new_articles(true).await,
        PollOutcome::Notified { .. }
    ));
}
