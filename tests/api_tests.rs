//! HTTP surface tests driven through the router with `oneshot`.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use cloud_drive::hashing::sha256_hex;
use common::{TestDrive, split_into_chunks, test_data, whole_file_hash};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

const BOUNDARY: &str = "cloud-drive-test-boundary";

async fn send(router: &axum::Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn json_request(
    router: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    owner: Option<Uuid>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(owner) = owner {
        builder = builder.header("x-owner-id", owner.to_string());
    }
    let body = match body {
        Some(v) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&v).unwrap())
        }
        None => Body::empty(),
    };

    let (status, bytes) = send(router, builder.body(body).unwrap()).await;
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

/// Encode text fields and one optional file field as `multipart/form-data`.
fn multipart_body(fields: &[(&str, &str)], file: Option<(&str, &str, &[u8])>) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some((name, file_name, data)) = file {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

async fn multipart_request(
    router: &axum::Router,
    uri: &str,
    owner: Uuid,
    body: Vec<u8>,
) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-owner-id", owner.to_string())
        .header(
            "Content-Type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap();
    let (status, bytes) = send(router, request).await;
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn health_endpoints_report_ok() {
    let drive = TestDrive::new().await;
    let router = drive.router();

    let (status, body) = json_request(&router, "GET", "/healthz", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = json_request(&router, "GET", "/readyz", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["sqlite"]["ok"], true);
    assert_eq!(body["checks"]["scripted"]["ok"], true);
}

#[tokio::test]
async fn owner_header_is_required() {
    let drive = TestDrive::new().await;
    let router = drive.router();

    let (status, body) = json_request(&router, "GET", "/quota", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    let request = Request::builder()
        .uri("/quota")
        .header("x-owner-id", "not-a-uuid")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chunked_upload_round_trip_over_http() {
    let drive = TestDrive::new().await;
    let router = drive.router();
    let owner = Uuid::new_v4();
    let data = test_data(2500, 40);

    let (status, created) = json_request(
        &router,
        "POST",
        "/uploads",
        Some(json!({
            "fileName": "report.pdf",
            "totalSize": data.len(),
            "contentHash": whole_file_hash(&data, 1024),
            "chunkSize": 1024,
        })),
        Some(owner),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["instantUpload"], false);
    assert_eq!(created["chunkCount"], 3);
    let session_id = created["sessionId"].as_str().unwrap().to_string();

    for (index, chunk) in split_into_chunks(&data, 1024).iter().enumerate() {
        let body = multipart_body(
            &[
                ("index", index.to_string().as_str()),
                ("chunkHash", sha256_hex(chunk).as_str()),
            ],
            Some(("chunk", "blob", &chunk[..])),
        );
        let (status, accepted) =
            multipart_request(&router, &format!("/uploads/{session_id}/chunks"), owner, body).await;
        assert_eq!(status, StatusCode::OK, "{accepted}");
        assert_eq!(accepted["accepted"], true);
        assert_eq!(accepted["index"], index);
    }

    let (status, progress) = json_request(
        &router,
        "GET",
        &format!("/uploads/{session_id}"),
        None,
        Some(owner),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(progress["receivedCount"], 3);
    assert_eq!(progress["missingIndices"], json!([]));
    assert_eq!(progress["status"], "uploading");

    let (status, completed) = json_request(
        &router,
        "POST",
        &format!("/uploads/{session_id}/complete"),
        None,
        Some(owner),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(completed["fileRecord"]["size"], 2500);
    let file_id = completed["fileRecord"]["id"].as_str().unwrap().to_string();

    let request = Request::builder()
        .uri(format!("/files/{file_id}/content"))
        .header("x-owner-id", owner.to_string())
        .body(Body::empty())
        .unwrap();
    let (status, content) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content, data);

    let (_, quota) = json_request(&router, "GET", "/quota", None, Some(owner)).await;
    assert_eq!(quota["used"], 2500);

    let (status, _) = json_request(
        &router,
        "DELETE",
        &format!("/files/{file_id}"),
        None,
        Some(owner),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, quota) = json_request(&router, "GET", "/quota", None, Some(owner)).await;
    assert_eq!(quota["used"], 0);

    let (status, body) =
        json_request(&router, "GET", &format!("/files/{file_id}"), None, Some(owner)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "file_not_found");
}

#[tokio::test]
async fn duplicate_session_points_at_the_open_one() {
    let drive = TestDrive::new().await;
    let router = drive.router();
    let owner = Uuid::new_v4();
    let data = test_data(4000, 41);
    let request = json!({
        "fileName": "dup.bin",
        "totalSize": data.len(),
        "contentHash": whole_file_hash(&data, 1024),
        "chunkSize": 1024,
    });

    let (_, created) =
        json_request(&router, "POST", "/uploads", Some(request.clone()), Some(owner)).await;
    let (status, body) = json_request(&router, "POST", "/uploads", Some(request), Some(owner)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "duplicate_session");
    assert_eq!(body["sessionId"], created["sessionId"]);
    assert_eq!(body["retryable"], false);
}

#[tokio::test]
async fn bad_chunk_hash_and_incomplete_completion() {
    let drive = TestDrive::new().await;
    let router = drive.router();
    let owner = Uuid::new_v4();
    let data = test_data(2048, 42);

    let (_, created) = json_request(
        &router,
        "POST",
        "/uploads",
        Some(json!({
            "fileName": "x.bin",
            "totalSize": data.len(),
            "contentHash": whole_file_hash(&data, 1024),
            "chunkSize": 1024,
        })),
        Some(owner),
    )
    .await;
    let session_id = created["sessionId"].as_str().unwrap().to_string();

    let body = multipart_body(
        &[("index", "0"), ("chunkHash", sha256_hex(b"nope").as_str())],
        Some(("chunk", "blob", &data[..1024])),
    );
    let (status, err) =
        multipart_request(&router, &format!("/uploads/{session_id}/chunks"), owner, body).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(err["code"], "chunk_hash_mismatch");
    assert_eq!(err["retryable"], true);

    let (status, err) = json_request(
        &router,
        "POST",
        &format!("/uploads/{session_id}/complete"),
        None,
        Some(owner),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["missingIndices"], json!([0, 1]));

    let (status, body) = json_request(
        &router,
        "DELETE",
        &format!("/uploads/{session_id}"),
        None,
        Some(owner),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));

    let (status, _) = json_request(
        &router,
        "GET",
        &format!("/uploads/{session_id}"),
        None,
        Some(owner),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn small_file_upload_and_instant_repeat() {
    let drive = TestDrive::new().await;
    let router = drive.router();
    let owner = Uuid::new_v4();
    let parent = Uuid::new_v4();
    let data = b"hello, drive".to_vec();

    let body = multipart_body(
        &[("parentId", parent.to_string().as_str())],
        Some(("file", "hello.txt", data.as_slice())),
    );
    let (status, stored) = multipart_request(&router, "/files", owner, body).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(stored["instantUpload"], false);
    assert_eq!(stored["fileRecord"]["name"], "hello.txt");
    assert_eq!(stored["fileRecord"]["parentId"], parent.to_string());

    let (status, _) = json_request(
        &router,
        "POST",
        "/uploads",
        Some(json!({
            "fileName": "hello again.txt",
            "totalSize": data.len(),
            "contentHash": sha256_hex(&data),
            "chunkSize": 1024,
        })),
        Some(owner),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}
