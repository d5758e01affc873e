use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Request, StatusCode};

use crate::engines::{LfuCache, LruCache};
use crate::key::{fingerprint, KeyConfig};
use crate::worker::UpdateQueue;
use crate::{strip_hop_by_hop, CachedResponse, Cacher, Freshness, Result};

// Roughly ten bytes of cacheable body.
const TINY_CAPACITY_MB: f64 = 0.00001;

fn envelope(body: &str) -> CachedResponse {
    CachedResponse::new(
        StatusCode::OK,
        HeaderMap::new(),
        Bytes::copy_from_slice(body.as_bytes()),
    )
}

fn parts_of(req: Request<()>) -> http::request::Parts {
    req.into_parts().0
}

async fn present(cache: &impl Cacher, key: &str) -> bool {
    cache.lookup(key).await.expect("lookup failed").is_some()
}

#[tokio::test]
async fn lru_store_then_lookup_round_trips() -> Result<()> {
    let cache = LruCache::new(1.0, Duration::from_secs(5), Duration::from_millis(500));
    cache.store("k", envelope("payload")).await?;
    let (hit, freshness) = cache.lookup("k").await?.expect("entry just stored");
    assert_eq!(hit.body.as_ref(), b"payload");
    assert_eq!(hit.status, StatusCode::OK);
    assert_eq!(freshness, Freshness::Fresh);
    Ok(())
}

#[tokio::test]
async fn lru_no_eviction_below_capacity() -> Result<()> {
    let cache = LruCache::new(1.0, Duration::from_secs(5), Duration::from_millis(500));
    for key in ["1", "2", "3", "4"] {
        cache.store(key, envelope("abc")).await?;
    }
    assert_eq!(cache.len(), 4);
    Ok(())
}

#[tokio::test]
async fn lru_evicts_least_recently_used_first() -> Result<()> {
    let cache = LruCache::new(TINY_CAPACITY_MB, Duration::from_secs(5), Duration::from_millis(500));
    cache.store("1", envelope("abc")).await?;
    cache.store("2", envelope("abc")).await?;
    cache.store("3", envelope("abc")).await?;

    // Touch "1" so "2" becomes the eviction victim.
    assert!(present(&cache, "1").await);
    cache.store("4", envelope("abc")).await?;

    assert!(!present(&cache, "2").await);
    assert!(present(&cache, "1").await);
    assert!(present(&cache, "3").await);
    assert!(present(&cache, "4").await);

    cache.store("5", envelope("abcde")).await?;
    assert!(!present(&cache, "1").await);
    assert!(!present(&cache, "3").await);
    assert!(present(&cache, "5").await);
    Ok(())
}

#[tokio::test]
async fn lru_overwrite_replaces_value_and_size() -> Result<()> {
    let cache = LruCache::new(TINY_CAPACITY_MB, Duration::from_secs(5), Duration::from_millis(500));
    cache.store("1", envelope("aaaaaaaa")).await?;
    cache.store("1", envelope("bb")).await?;
    let (hit, _) = cache.lookup("1").await?.expect("entry present");
    assert_eq!(hit.body.as_ref(), b"bb");
    assert_eq!(cache.len(), 1);

    // The overwrite freed eight bytes, so two more three-byte bodies fit.
    cache.store("2", envelope("ccc")).await?;
    cache.store("3", envelope("ddd")).await?;
    assert_eq!(cache.len(), 3);
    Ok(())
}

#[tokio::test]
async fn lru_rejects_body_larger_than_capacity() -> Result<()> {
    let cache = LruCache::new(TINY_CAPACITY_MB, Duration::from_secs(5), Duration::from_millis(500));
    cache.store("small", envelope("abc")).await?;
    cache.store("huge", envelope("way too big for the cache")).await?;
    assert!(!present(&cache, "huge").await);
    // The rejected store must not have evicted anything.
    assert!(present(&cache, "small").await);
    Ok(())
}

#[tokio::test]
async fn lfu_evicts_lowest_frequency_first() -> Result<()> {
    let cache = LfuCache::new(TINY_CAPACITY_MB, Duration::from_secs(5), Duration::from_millis(500));
    cache.store("1", envelope("abc")).await?;
    cache.store("2", envelope("abc")).await?;
    cache.store("3", envelope("abc")).await?;

    // All three now sit at frequency two.
    assert!(present(&cache, "1").await);
    assert!(present(&cache, "2").await);
    assert!(present(&cache, "3").await);

    // "4" enters at frequency one after the frequency-two tail ("1") makes room.
    cache.store("4", envelope("abc")).await?;
    assert_eq!(cache.len(), 3);

    // "5" needs five bytes: "4" (lowest frequency) goes first, then the
    // frequency-two tail ("2").
    cache.store("5", envelope("abcde")).await?;
    assert!(!present(&cache, "4").await);
    assert!(present(&cache, "5").await);
    assert!(present(&cache, "3").await);
    Ok(())
}

#[tokio::test]
async fn lfu_frequency_survives_overwrite() -> Result<()> {
    let cache = LfuCache::new(TINY_CAPACITY_MB, Duration::from_secs(5), Duration::from_millis(500));
    cache.store("hot", envelope("abc")).await?;
    assert!(present(&cache, "hot").await);
    assert!(present(&cache, "hot").await);
    cache.store("cold", envelope("abc")).await?;
    cache.store("hot", envelope("abc")).await?;

    // Capacity forces one eviction; "cold" at frequency one loses.
    cache.store("new", envelope("abcde")).await?;
    assert!(present(&cache, "hot").await);
    assert!(!present(&cache, "cold").await);
    Ok(())
}

#[tokio::test]
async fn entries_go_stale_after_the_horizon() -> Result<()> {
    let cache = LruCache::new(1.0, Duration::from_millis(100), Duration::from_millis(500));
    cache.store("k", envelope("abc")).await?;

    let (_, freshness) = cache.lookup("k").await?.expect("entry present");
    assert_eq!(freshness, Freshness::Fresh);
    assert!(!freshness.is_stale());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let (hit, freshness) = cache.lookup("k").await?.expect("stale entries are not removed");
    assert_eq!(freshness, Freshness::Stale);
    assert_eq!(hit.body.as_ref(), b"abc");
    Ok(())
}

#[tokio::test]
async fn restore_resets_the_freshness_clock() -> Result<()> {
    let cache = LfuCache::new(1.0, Duration::from_millis(100), Duration::from_millis(500));
    cache.store("k", envelope("v1")).await?;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(cache.lookup("k").await?.expect("present").1, Freshness::Stale);

    cache.store("k", envelope("v2")).await?;
    let (hit, freshness) = cache.lookup("k").await?.expect("present");
    assert_eq!(freshness, Freshness::Fresh);
    assert_eq!(hit.body.as_ref(), b"v2");
    Ok(())
}

#[test]
fn fingerprint_is_insensitive_to_query_order() {
    let config = KeyConfig { hash_query: true, ..KeyConfig::default() };
    let a = fingerprint(
        &parts_of(Request::get("/api/users?name=john&age=30").body(()).unwrap()),
        &config,
    );
    let b = fingerprint(
        &parts_of(Request::get("/api/users?age=30&name=john").body(()).unwrap()),
        &config,
    );
    assert_eq!(a, b);
    assert_eq!(a.len(), 64);
}

#[test]
fn fingerprint_is_insensitive_to_multi_value_order() {
    let config = KeyConfig { hash_query: true, ..KeyConfig::default() };
    let a = fingerprint(&parts_of(Request::get("/list?tag=b&tag=a").body(()).unwrap()), &config);
    let b = fingerprint(&parts_of(Request::get("/list?tag=a&tag=b").body(()).unwrap()), &config);
    assert_eq!(a, b);
}

#[test]
fn fingerprint_skips_ignored_parameters() {
    let config = KeyConfig {
        hash_query: true,
        query_ignore: HashSet::from(["timestamp".to_owned()]),
        ..KeyConfig::default()
    };
    let plain = fingerprint(
        &parts_of(Request::get("/api/users?name=john&age=30").body(()).unwrap()),
        &config,
    );
    let with_noise = fingerprint(
        &parts_of(Request::get("/api/users?age=30&TIMESTAMP=123&name=john").body(()).unwrap()),
        &config,
    );
    assert_eq!(plain, with_noise);
}

#[test]
fn fingerprint_separates_distinct_requests() {
    let config = KeyConfig { hash_query: true, ..KeyConfig::default() };
    let a = fingerprint(&parts_of(Request::get("/a?x=1").body(()).unwrap()), &config);
    let b = fingerprint(&parts_of(Request::get("/a?x=2").body(()).unwrap()), &config);
    let c = fingerprint(&parts_of(Request::get("/b?x=1").body(()).unwrap()), &config);
    assert_ne!(a, b);
    assert_ne!(a, c);
}

#[test]
fn fingerprint_ignores_query_when_disabled() {
    let config = KeyConfig::default();
    let a = fingerprint(&parts_of(Request::get("/a?x=1").body(()).unwrap()), &config);
    let b = fingerprint(&parts_of(Request::get("/a?x=2").body(()).unwrap()), &config);
    assert_eq!(a, b);
}

#[test]
fn fingerprint_hashes_configured_headers_order_insensitively() {
    let config = KeyConfig {
        hash_headers: vec!["x-tenant".to_owned(), "accept-language".to_owned()],
        ..KeyConfig::default()
    };
    let a = parts_of(
        Request::get("/doc")
            .header("X-Tenant", "acme")
            .header("Accept-Language", "de")
            .header("Accept-Language", "en")
            .body(())
            .unwrap(),
    );
    let b = parts_of(
        Request::get("/doc")
            .header("accept-language", "en")
            .header("accept-language", "de")
            .header("x-tenant", "acme")
            .body(())
            .unwrap(),
    );
    assert_eq!(fingerprint(&a, &config), fingerprint(&b, &config));

    let other_tenant = parts_of(Request::get("/doc").header("x-tenant", "globex").body(()).unwrap());
    assert_ne!(fingerprint(&a, &config), fingerprint(&other_tenant, &config));
}

#[test]
fn fingerprint_absent_hashed_header_contributes_nothing() {
    let config = KeyConfig { hash_headers: vec!["x-tenant".to_owned()], ..KeyConfig::default() };
    let bare = fingerprint(&parts_of(Request::get("/doc").body(()).unwrap()), &config);
    let unrelated = fingerprint(
        &parts_of(Request::get("/doc").header("accept", "text/html").body(()).unwrap()),
        &config,
    );
    assert_eq!(bare, unrelated);
}

#[test]
fn global_key_short_circuits_hashing() {
    let config = KeyConfig {
        hash_query: true,
        global_keys: vec![("/assets".to_owned(), "static-assets".to_owned())],
        ..KeyConfig::default()
    };
    let a = fingerprint(&parts_of(Request::get("/assets/app.js").body(()).unwrap()), &config);
    let b = fingerprint(
        &parts_of(Request::post("/assets/other.css?v=2").header("x-any", "thing").body(()).unwrap()),
        &config,
    );
    assert_eq!(a, "static-assets");
    assert_eq!(b, "static-assets");

    let miss = fingerprint(&parts_of(Request::get("/api/assets").body(()).unwrap()), &config);
    assert_ne!(miss, "static-assets");
}

#[test]
fn first_matching_global_key_wins() {
    let config = KeyConfig {
        global_keys: vec![
            ("/static/fonts".to_owned(), "fonts".to_owned()),
            ("/static".to_owned(), "static".to_owned()),
        ],
        ..KeyConfig::default()
    };
    let fonts = fingerprint(&parts_of(Request::get("/static/fonts/a.woff").body(()).unwrap()), &config);
    let other = fingerprint(&parts_of(Request::get("/static/app.css").body(()).unwrap()), &config);
    assert_eq!(fonts, "fonts");
    assert_eq!(other, "static");
}

#[tokio::test]
async fn update_queue_runs_admitted_work() {
    let queue = UpdateQueue::new(10);
    let ran = AtomicUsize::new(0);
    queue.start("key", async { ran.fetch_add(1, Ordering::SeqCst); }).await;
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(queue.in_flight(), 0);
}

#[tokio::test]
async fn update_queue_is_single_flight_per_key() {
    let queue = UpdateQueue::new(10);
    let ran = AtomicUsize::new(0);

    // Both futures are polled on this task: the first admits the key and
    // parks on the sleep, so the second must be turned away.
    tokio::join!(
        queue.start("key", async {
            ran.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }),
        queue.start("key", async {
            ran.fetch_add(1, Ordering::SeqCst);
        }),
    );
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    // The key was released, so a later refresh is admitted again.
    queue.start("key", async { ran.fetch_add(1, Ordering::SeqCst); }).await;
    assert_eq!(ran.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn update_queue_drops_work_over_capacity() {
    let queue = UpdateQueue::new(1);
    let ran = AtomicUsize::new(0);
    tokio::join!(
        queue.start("a", async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }),
        queue.start("b", async {
            ran.fetch_add(1, Ordering::SeqCst);
        }),
    );
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(queue.in_flight(), 0);
}

#[tokio::test]
async fn update_queue_releases_key_after_panic() {
    let queue = Arc::new(UpdateQueue::new(10));
    let handle = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            queue.start("key", async { panic!("refresh blew up") }).await;
        })
    };
    assert!(handle.await.is_err());
    assert_eq!(queue.in_flight(), 0);

    let ran = AtomicUsize::new(0);
    queue.start("key", async { ran.fetch_add(1, Ordering::SeqCst); }).await;
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn strip_hop_by_hop_removes_standard_and_listed_headers() {
    let mut headers = HeaderMap::new();
    headers.insert("connection", HeaderValue::from_static("keep-alive, x-internal-token"));
    headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
    headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
    headers.insert("x-internal-token", HeaderValue::from_static("abc"));
    headers.insert("content-type", HeaderValue::from_static("text/plain"));

    strip_hop_by_hop(&mut headers);

    assert!(headers.get("connection").is_none());
    assert!(headers.get("keep-alive").is_none());
    assert!(headers.get("transfer-encoding").is_none());
    assert!(headers.get("x-internal-token").is_none());
    assert_eq!(headers.get("content-type").unwrap(), "text/plain");
}

#[test]
fn strip_for_storage_drops_set_cookie() {
    let mut headers = HeaderMap::new();
    headers.append("set-cookie", HeaderValue::from_static("a=1"));
    headers.append("set-cookie", HeaderValue::from_static("b=2"));
    headers.insert("cache-control", HeaderValue::from_static("no-store"));
    let mut envelope = CachedResponse::new(StatusCode::OK, headers, Bytes::from_static(b"x"));

    envelope.strip_for_storage();

    assert!(envelope.headers.get("set-cookie").is_none());
    assert_eq!(envelope.headers.get("cache-control").unwrap(), "no-store");
}

#[test]
fn header_order_is_preserved_in_the_envelope() {
    let mut headers = HeaderMap::new();
    headers.append("x-trace", HeaderValue::from_static("first"));
    headers.append("x-trace", HeaderValue::from_static("second"));
    let envelope = CachedResponse::new(StatusCode::OK, headers, Bytes::new());

    let values: Vec<_> = envelope.headers.get_all("x-trace").iter().collect();
    assert_eq!(values, ["first", "second"]);
}
