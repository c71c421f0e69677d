use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use esi_client::{Config, EsiClient, FetchOptions};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn healthy_client(server: &MockServer) -> Arc<EsiClient> {
    Mock::given(method("GET"))
        .and(path("/meta/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"routes": []})))
        .mount(server)
        .await;

    let base_url = url::Url::parse(&format!("{}/", server.uri())).unwrap();
    let config = Config::new(base_url, "esi-client-tests/0.0").with_health_cache_ttl(Duration::from_millis(50));
    EsiClient::builder(config).build().await
}

#[tokio::test]
async fn s1_simple_get_then_cache_hit_without_a_second_transport_call() {
    let server = MockServer::start().await;
    let client = healthy_client(&server).await;

    Mock::given(method("GET"))
        .and(path("/test"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Expires", "Thu, 01 Jan 2100 00:00:00 GMT")
                .insert_header("ETag", "\"abc\"")
                .set_body_json(json!({"id": 1})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let value: serde_json::Value = client.fetch("/test", FetchOptions::default()).await.unwrap();
    assert_eq!(value, json!({"id": 1}));

    let with_meta = client.fetch_with_meta::<serde_json::Value>("/test", FetchOptions::default()).await.unwrap();
    assert!(with_meta.not_modified);
    assert_eq!(with_meta.data, json!({"id": 1}));
}

#[tokio::test]
async fn s2_304_revalidation_updates_expiry_and_keeps_cached_body() {
    let server = MockServer::start().await;
    let client = healthy_client(&server).await;

    Mock::given(method("GET"))
        .and(path("/test"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Expires", "Thu, 01 Jan 1970 00:00:01 GMT")
                .insert_header("ETag", "\"abc\"")
                .set_body_json(json!({"id": 1})),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/test"))
        .and(header("If-None-Match", "\"abc\""))
        .respond_with(ResponseTemplate::new(304).insert_header("Expires", "Thu, 01 Jan 2100 00:00:00 GMT"))
        .mount(&server)
        .await;

    let first: serde_json::Value = client.fetch("/test", FetchOptions::default()).await.unwrap();
    assert_eq!(first, json!({"id": 1}));

    let revalidated = client
        .fetch_with_meta::<serde_json::Value>("/test", FetchOptions { etag_override: Some("\"abc\"".to_string()), ..Default::default() })
        .await
        .unwrap();
    assert!(revalidated.not_modified);
    assert_eq!(revalidated.data, json!({"id": 1}));
}

#[tokio::test]
async fn s3_rate_limit_recovery_retries_once_after_429() {
    let server = MockServer::start().await;
    let client = healthy_client(&server).await;

    Mock::given(method("GET"))
        .and(path("/limited"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/limited"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Expires", "Thu, 01 Jan 2100 00:00:00 GMT")
                .insert_header("ETag", "\"e1\"")
                .set_body_json(json!({"ok": true})),
        )
        .mount(&server)
        .await;

    let value: serde_json::Value = client.fetch("/limited", FetchOptions::default()).await.unwrap();
    assert_eq!(value, json!({"ok": true}));
}

#[tokio::test]
async fn s4_concurrent_identical_gets_invoke_the_transport_once() {
    let server = MockServer::start().await;
    let client = healthy_client(&server).await;

    Mock::given(method("GET"))
        .and(path("/dedup"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(50))
                .insert_header("Expires", "Thu, 01 Jan 2100 00:00:00 GMT")
                .insert_header("ETag", "\"e1\"")
                .set_body_json(json!({"shared": true})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let a = client.clone();
    let b = client.clone();
    let t1 = tokio::spawn(async move { a.fetch::<serde_json::Value>("/dedup", FetchOptions::default()).await });
    let t2 = tokio::spawn(async move { b.fetch::<serde_json::Value>("/dedup", FetchOptions::default()).await });

    let (r1, r2) = tokio::join!(t1, t2);

    assert_eq!(r1.unwrap().unwrap(), json!({"shared": true}));
    assert_eq!(r2.unwrap().unwrap(), json!({"shared": true}));
}

#[tokio::test]
async fn dedup_does_not_cross_principals() {
    let server = MockServer::start().await;
    let client = healthy_client(&server).await;

    Mock::given(method("GET"))
        .and(path("/characters/1/assets/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Expires", "Thu, 01 Jan 2100 00:00:00 GMT")
                .insert_header("ETag", "\"e1\"")
                .set_body_json(json!({"owner": 1})),
        )
        .expect(2)
        .mount(&server)
        .await;

    let a = client.clone();
    let b = client.clone();
    let t1 = tokio::spawn(async move {
        a.fetch::<serde_json::Value>("/characters/1/assets/", FetchOptions { character_id: Some(1), requires_auth: Some(false), ..Default::default() }).await
    });
    let t2 = tokio::spawn(async move {
        b.fetch::<serde_json::Value>("/characters/1/assets/", FetchOptions { character_id: Some(2), requires_auth: Some(false), ..Default::default() }).await
    });

    let (r1, r2) = tokio::join!(t1, t2);
    assert_eq!(r1.unwrap().unwrap(), json!({"owner": 1}));
    assert_eq!(r2.unwrap().unwrap(), json!({"owner": 1}));
}

#[tokio::test]
async fn s5_sequential_pagination_concatenates_pages_in_order() {
    let server = MockServer::start().await;
    let client = healthy_client(&server).await;

    for page in 1..=3u32 {
        let mut response = ResponseTemplate::new(200)
            .insert_header("Expires", "Thu, 01 Jan 2100 00:00:00 GMT")
            .insert_header("ETag", format!("\"e{page}\""))
            .set_body_json(json!([page]));
        if page == 1 {
            response = response.insert_header("X-Pages", "3");
        }
        Mock::given(method("GET"))
            .and(path("/multi"))
            .and(query_param("page", page.to_string()))
            .respond_with(response)
            .expect(1)
            .mount(&server)
            .await;
    }

    let items: Vec<u32> = client.fetch_paginated("/multi", FetchOptions::default()).await.unwrap();
    assert_eq!(items, vec![1, 2, 3]);
}

#[tokio::test]
async fn s6_progress_callback_reaches_total_pages() {
    let server = MockServer::start().await;
    let client = healthy_client(&server).await;

    for page in 1..=3u32 {
        let mut response = ResponseTemplate::new(200)
            .insert_header("Expires", "Thu, 01 Jan 2100 00:00:00 GMT")
            .insert_header("ETag", format!("\"e{page}\""))
            .set_body_json(json!([page]));
        if page == 1 {
            response = response.insert_header("X-Pages", "3");
        }
        Mock::given(method("GET"))
            .and(path("/multi"))
            .and(query_param("page", page.to_string()))
            .respond_with(response)
            .mount(&server)
            .await;
    }

    let seen_total = Arc::new(AtomicUsize::new(0));
    let max_completed = Arc::new(AtomicUsize::new(0));
    let seen_total_cb = seen_total.clone();
    let max_completed_cb = max_completed.clone();

    let with_meta = client
        .fetch_paginated_with_progress::<u32, _>("/multi", FetchOptions::default(), move |progress| {
            seen_total_cb.store(progress.total, Ordering::SeqCst);
            max_completed_cb.fetch_max(progress.completed, Ordering::SeqCst);
        })
        .await
        .unwrap();

    assert_eq!(with_meta.data, vec![1, 2, 3]);
    assert_eq!(seen_total.load(Ordering::SeqCst), 3);
    assert_eq!(max_completed.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn s7_health_down_fails_synchronously_without_a_transport_call() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/meta/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "routes": [{"method": "get", "path": "/markets/{id}/orders/", "status": "down"}]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/markets/prices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&server)
        .await;

    let base_url = url::Url::parse(&format!("{}/", server.uri())).unwrap();
    let config = Config::new(base_url, "esi-client-tests/0.0").with_health_cache_ttl(Duration::from_millis(50));
    let client = EsiClient::builder(config).build().await;

    let err = client.fetch::<serde_json::Value>("/markets/prices", FetchOptions::default()).await.unwrap_err();
    assert_eq!(err.status, 503);
}
