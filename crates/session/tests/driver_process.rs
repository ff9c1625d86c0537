//! Drives a shell script that answers the JSON-lines protocol with canned
//! responses, one per request in order.

#![cfg(unix)]

use framecast_common::config::DriverConfig;
use framecast_common::error::FramecastError;
use framecast_session::{ClipRect, DriverEngine, LaunchOptions, RenderEngine};

fn scripted_driver(body: &str) -> DriverEngine {
    DriverEngine::new(DriverConfig {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), body.to_string()],
    })
}

#[tokio::test]
async fn driver_round_trips_requests_in_order() {
    let engine = scripted_driver(
        r#"
        read l; echo '{"id":1,"result":null}'
        read l; echo 'loading page...'; echo '{"id":2,"result":null}'
        read l; echo '{"id":3,"result":{"width":4,"height":2,"fps":30,"frameCount":1}}'
        read l; echo '{"id":4,"result":"aGVsbG8="}'
        read l; echo '{"id":5,"error":"no such element"}'
        read l; echo '{"id":6,"result":null}'
        "#,
    );

    let instance = engine.launch(&LaunchOptions::default()).await.unwrap();
    instance.navigate("http://localhost/movie").await.unwrap();

    let value = instance.evaluate("window.__framecast.info()").await.unwrap();
    assert_eq!(value["frameCount"], 1);

    let png = instance.screenshot(ClipRect::from_size(4, 2)).await.unwrap();
    assert_eq!(png, b"hello");

    let err = instance.evaluate("document.querySelector('#x').click()").await.unwrap_err();
    assert!(err.to_string().contains("no such element"));

    instance.close().await.unwrap();
    instance.close().await.unwrap();
}

#[tokio::test]
async fn missing_driver_is_a_launch_error() {
    let engine = DriverEngine::new(DriverConfig {
        program: "framecast-driver-that-does-not-exist".to_string(),
        args: Vec::new(),
    });
    let err = engine.launch(&LaunchOptions::default()).await.err().unwrap();
    assert!(matches!(err, FramecastError::Launch { .. }));
}

#[tokio::test]
async fn driver_exit_mid_request_is_an_engine_error() {
    let engine = scripted_driver(r#"read l; echo '{"id":1,"result":null}'; read l; exit 0"#);
    let instance = engine.launch(&LaunchOptions::default()).await.unwrap();
    let err = instance.navigate("http://localhost/movie").await.unwrap_err();
    assert!(matches!(err, FramecastError::Navigation { .. }));
    instance.close().await.unwrap();
}
