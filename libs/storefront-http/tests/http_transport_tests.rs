use httpmock::prelude::*;
use serde_json::json;
use std::time::Duration;
use storefront_http::{
    ApiError, ApiOptimizationService, ApiRequest, BreakerPolicy, CachePolicy, CircuitStatus,
    HttpTransport, ResilienceService, ResilientTransport, Transport,
};

fn transport(server: &MockServer) -> HttpTransport {
    HttpTransport::builder()
        .allow_insecure_http()
        .base_url(server.base_url())
        .build()
        .unwrap()
}

#[tokio::test]
async fn cached_get_hits_server_once() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(Method::GET)
            .path("/products")
            .query_param("collection", "soy")
            .header("accept", "application/json");
        then.status(200)
            .json_body(json!([{"sku": "SOY-8OZ", "price": 1800}]));
    });

    let service = ApiOptimizationService::with_defaults(transport(&server));
    let request = ApiRequest::get("/products?collection=soy").cache(CachePolicy::max_age(Duration::from_secs(60)));

    let first = service.request_value(&request).await.unwrap();
    let second = service.request_value(&request).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first[0]["sku"], "SOY-8OZ");
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn graphql_query_posts_envelope() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(Method::POST)
            .path("/graphql")
            .header("content-type", "application/json")
            .json_body(json!({
                "query": "query Product($sku: String!) { product(sku: $sku) { name } }",
                "variables": {"sku": "CED-12OZ"}
            }));
        then.status(200)
            .json_body(json!({"data": {"product": {"name": "Cedar & Sage"}}}));
    });

    let request = ApiRequest::graphql(
        "/graphql",
        "query Product($sku: String!) { product(sku: $sku) { name } }",
        json!({"sku": "CED-12OZ"}),
    );
    let value = transport(&server).send(&request).await.unwrap();

    assert_eq!(value["data"]["product"]["name"], "Cedar & Sage");
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn graphql_errors_become_api_error() {
    let server = MockServer::start();
    let _m = server.mock(|when, then| {
        when.method(Method::POST).path("/graphql");
        then.status(200).json_body(json!({
            "data": null,
            "errors": [{"message": "Product not found"}, {"message": "Try another SKU"}]
        }));
    });

    let request = ApiRequest::graphql("/graphql", "{ product { name } }", json!({}));
    match transport(&server).send(&request).await {
        Err(ApiError::GraphQl { messages }) => {
            assert_eq!(messages, vec!["Product not found", "Try another SKU"]);
        }
        other => panic!("expected GraphQl error, got: {other:?}"),
    }
}

#[tokio::test]
async fn non_2xx_carries_status_preview_and_retry_after() {
    let server = MockServer::start();
    let _m = server.mock(|when, then| {
        when.method(Method::GET).path("/cart");
        then.status(429)
            .header("retry-after", "2")
            .body("slow down");
    });

    let err = transport(&server)
        .send(&ApiRequest::get("/cart"))
        .await
        .unwrap_err();

    match &err {
        ApiError::HttpStatus {
            status,
            body_preview,
            retry_after,
        } => {
            assert_eq!(status.as_u16(), 429);
            assert_eq!(body_preview, "slow down");
            assert_eq!(*retry_after, Some(Duration::from_secs(2)));
        }
        other => panic!("expected HttpStatus, got: {other:?}"),
    }
    assert!(err.is_retryable(&[429]));
}

#[tokio::test]
async fn empty_success_body_is_null() {
    let server = MockServer::start();
    let _m = server.mock(|when, then| {
        when.method(Method::DELETE).path("/wishlist/SOY-8OZ");
        then.status(204);
    });

    let value = transport(&server)
        .send(&ApiRequest::delete("/wishlist/SOY-8OZ"))
        .await
        .unwrap();
    assert!(value.is_null());
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let server = MockServer::start();
    let large = format!("\"{}\"", "x".repeat(4096));
    let _m = server.mock(|when, then| {
        when.method(Method::GET).path("/catalog");
        then.status(200).body(&large);
    });

    let transport = HttpTransport::builder()
        .allow_insecure_http()
        .base_url(server.base_url())
        .max_body_size(1024)
        .build()
        .unwrap();

    let result = transport.send(&ApiRequest::get("/catalog")).await;
    assert!(matches!(result, Err(ApiError::BodyTooLarge { limit: 1024, .. })));
}

#[tokio::test]
async fn slow_server_times_out() {
    let server = MockServer::start();
    let _m = server.mock(|when, then| {
        when.method(Method::GET).path("/slow");
        then.status(200).delay(Duration::from_secs(2)).json_body(json!({}));
    });

    let transport = HttpTransport::builder()
        .allow_insecure_http()
        .base_url(server.base_url())
        .timeout(Duration::from_millis(100))
        .build()
        .unwrap();

    let result = transport.send(&ApiRequest::get("/slow")).await;
    assert!(matches!(result, Err(ApiError::Timeout(_))));
}

#[tokio::test]
async fn tls_only_rejects_plain_http() {
    let server = MockServer::start();
    let transport = HttpTransport::builder().build().unwrap();

    let result = transport
        .send(&ApiRequest::get(format!("{}/products", server.base_url())))
        .await;
    assert!(matches!(result, Err(ApiError::InvalidScheme { .. })));
}

#[tokio::test]
async fn breaker_trips_on_server_errors() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(Method::GET).path("/checkout/rates");
        then.status(503);
    });

    let resilience = ResilienceService::new();
    let policy = BreakerPolicy {
        failure_threshold: 2,
        reset_timeout: Duration::from_secs(60),
        half_open_requests: 1,
    };
    let guarded = ResilientTransport::new(transport(&server), resilience.clone(), policy);
    let request = ApiRequest::get("/checkout/rates");

    for _ in 0..2 {
        assert!(matches!(
            guarded.send(&request).await,
            Err(ApiError::HttpStatus { .. })
        ));
    }
    assert!(matches!(
        guarded.send(&request).await,
        Err(ApiError::CircuitOpen { .. })
    ));
    assert_eq!(mock.calls(), 2);
    assert_eq!(
        resilience.circuit_state("GET /checkout/rates").unwrap().status,
        CircuitStatus::Open
    );
}
