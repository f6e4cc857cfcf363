//! Integration Tests for the Riven Plane
//!
//! These tests drive a provisioned kernel end to end:
//! - provisioning, tokens and pairing
//! - blessing grants, spawns, revocation and pruning
//! - the HTTP routes

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use riven_core::{
    DenyReason, DeviceId, MirrorConfig, PropagationDecision, ReflectionPayload, TokenLabel,
    TrustError,
};
use riven_plane::{
    create_router, AppState, FixedFingerprint, KernelConfig, MemoryBackend, PlaneConfig,
    TrustKernel,
};
use std::sync::Arc;
use tower::ServiceExt;

// =============================================================================
// Test Helpers
// =============================================================================

async fn provisioned_kernel() -> (Arc<TrustKernel>, DeviceId) {
    let device = DeviceId::generate();
    let kernel = TrustKernel::new(
        Arc::new(MemoryBackend::new()),
        Arc::new(FixedFingerprint(device)),
        KernelConfig::default(),
    );
    kernel.provision().await.expect("provision");
    (Arc::new(kernel), device)
}

async fn post_json(
    kernel: Arc<TrustKernel>,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let app = create_router(Arc::new(AppState {
        kernel,
        config: PlaneConfig::default(),
    }));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

// =============================================================================
// Kernel Tests
// =============================================================================

#[tokio::test]
async fn test_provision_creates_blessed_genesis() {
    let (kernel, device) = provisioned_kernel().await;
    let genesis = kernel.genesis().await.unwrap();

    assert_eq!(genesis.device_id, device);
    assert!(genesis.is_genesis());
    assert_eq!(
        kernel.request_blessing_check(&genesis.vault_id).await.unwrap(),
        PropagationDecision::Allow
    );

    let blessing = kernel.blessing(&genesis.vault_id).await.unwrap();
    assert!(blessing.blessed() && blessing.can_propagate);
}

#[tokio::test]
async fn test_same_device_token_skips_ledger() {
    let (kernel, device) = provisioned_kernel().await;
    let issued = kernel.issue_token(TokenLabel::Genesis).await.unwrap();

    let verification = kernel.verify_token(&issued.token, device).await.unwrap();
    assert!(verification.same_device);
    assert_eq!(verification.score, 100);
    assert!(verification.pairing.is_none());
    assert!(matches!(
        kernel.lookup_pairing(&device).await,
        Err(TrustError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_cross_device_token_records_pairing() {
    let (kernel, device) = provisioned_kernel().await;
    let issued = kernel.issue_token(TokenLabel::Pairing).await.unwrap();
    let other = DeviceId::generate();

    let verification = kernel.verify_token(&issued.token, other).await.unwrap();
    let pairing = verification.pairing.unwrap();
    assert_eq!(pairing.paired_device_id, other);
    assert_eq!(pairing.paired_with_device_id, device);
    assert_eq!(pairing.token_hash, issued.token_hash);
    assert_eq!(kernel.lookup_pairing(&other).await.unwrap(), pairing);

    // Presenting the same token again cannot improve on the recorded score
    assert!(matches!(
        kernel.verify_token(&issued.token, other).await,
        Err(TrustError::PairingDowngrade { .. })
    ));
}

#[tokio::test]
async fn test_unknown_token_is_format_error() {
    let (kernel, device) = provisioned_kernel().await;
    let forged = format!("cal-riven://{}", "0f".repeat(32));

    let err = kernel.verify_token(&forged, device).await.unwrap_err();
    assert!(matches!(err, TrustError::UnknownToken(_)));
    assert_eq!(err.exit_code(), 1);
}

#[tokio::test]
async fn test_enroll_then_grant() {
    let (kernel, _) = provisioned_kernel().await;
    let genesis = kernel.genesis().await.unwrap();
    let issued = kernel.issue_token(TokenLabel::Pairing).await.unwrap();
    let phone = DeviceId::generate();

    // Unpaired devices cannot be enrolled
    assert!(matches!(
        kernel.enroll(phone, &genesis.vault_id).await,
        Err(TrustError::NotFound(_))
    ));

    kernel.verify_token(&issued.token, phone).await.unwrap();
    let enrolled = kernel.enroll(phone, &genesis.vault_id).await.unwrap();
    assert_eq!(enrolled.tier, 1);
    assert_eq!(
        kernel.request_blessing_check(&enrolled.mirror_id).await.unwrap(),
        PropagationDecision::Deny(DenyReason::NotBlessed)
    );

    kernel
        .grant(&enrolled.mirror_id, &genesis.vault_id, true)
        .await
        .unwrap();
    let child = kernel
        .spawn_mirror_request(Some(enrolled.mirror_id), &MirrorConfig::default(), "phone-1")
        .await
        .unwrap();
    assert_eq!(child.tier, 2);
}

#[tokio::test]
async fn test_revoke_cascades_to_subtree() {
    let (kernel, _) = provisioned_kernel().await;
    let genesis = kernel.genesis().await.unwrap();
    let config = MirrorConfig::default();

    let a = kernel.spawn_mirror_request(None, &config, "a").await.unwrap();
    let b = kernel
        .spawn_mirror_request(Some(a.mirror_id), &config, "b")
        .await
        .unwrap();

    let revoked = kernel.revoke(&a.mirror_id, &genesis.vault_id).await.unwrap();
    assert_eq!(revoked, vec![a.mirror_id, b.mirror_id]);

    let err = kernel
        .spawn_mirror_request(Some(b.mirror_id), &config, "c")
        .await
        .unwrap_err();
    assert!(matches!(err, TrustError::BlessingDenied(DenyReason::Revoked)));
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn test_prune_and_lineage_lookups() {
    let (kernel, _) = provisioned_kernel().await;
    let genesis = kernel.genesis().await.unwrap();
    let config = MirrorConfig::default();

    let a = kernel.spawn_mirror_request(None, &config, "a").await.unwrap();
    kernel
        .spawn_mirror_request(Some(a.mirror_id), &config, "b")
        .await
        .unwrap();

    assert_eq!(kernel.children(&genesis.vault_id).await.unwrap(), vec![a.mirror_id]);
    assert_eq!(kernel.lineage(&a.mirror_id).await.unwrap(), a);

    let removed = kernel.prune(&a.mirror_id, &genesis.vault_id).await.unwrap();
    assert_eq!(removed.len(), 2);
    assert!(kernel.children(&genesis.vault_id).await.unwrap().is_empty());
    assert!(matches!(
        kernel.lineage(&a.mirror_id).await,
        Err(TrustError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_replay_records_operations() {
    let (kernel, device) = provisioned_kernel().await;
    kernel
        .submit_reflection(serde_json::json!({ "note": "hello" }))
        .await
        .unwrap();

    let entries = kernel.replay(Some(device)).await.unwrap().collect_all().await.unwrap();
    let kinds: Vec<&str> = entries.iter().map(|(_, payload)| payload.kind()).collect();

    assert!(kinds.contains(&"provisioned"));
    assert_eq!(kinds.last(), Some(&"submitted"));
    assert!(matches!(
        entries.last().map(|(_, p)| p),
        Some(ReflectionPayload::Submitted { .. })
    ));
}

// =============================================================================
// HTTP Tests
// =============================================================================

#[tokio::test]
async fn test_http_blessing_check() {
    let (kernel, _) = provisioned_kernel().await;
    let genesis = kernel.genesis().await.unwrap();

    let (status, body) = post_json(
        kernel.clone(),
        "/v1/blessing/check",
        serde_json::json!({ "identity": genesis.vault_id.to_hex() }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["decision"], "allow");

    let (status, body) = post_json(
        kernel.clone(),
        "/v1/blessing/check",
        serde_json::json!({ "identity": DeviceId::generate().to_hex() }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["decision"], "deny");
    assert_eq!(body["reason"], "unknown_identity");

    let (status, body) = post_json(
        kernel,
        "/v1/blessing/check",
        serde_json::json!({ "identity": "not-hex" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_http_reflections_and_mirrors() {
    let (kernel, _) = provisioned_kernel().await;

    let (status, body) = post_json(
        kernel.clone(),
        "/v1/reflections",
        serde_json::json!({ "payload": { "event": "login" } }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], true);
    assert!(body["sequence"].as_u64().unwrap() > 0);

    let request = serde_json::json!({
        "config": { "label": "worker", "propagate": false },
        "idempotency_key": "http-1",
    });
    let (status, first) = post_json(kernel.clone(), "/v1/mirrors", request.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["tier"], 1);

    let (_, second) = post_json(kernel.clone(), "/v1/mirrors", request).await;
    assert_eq!(first["mirror_id"], second["mirror_id"]);

    let child = first["mirror_id"].as_str().unwrap().to_string();
    let (status, body) = post_json(
        kernel,
        "/v1/mirrors",
        serde_json::json!({ "parent": child, "idempotency_key": "http-2" }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "BLESSING_DENIED");
    assert_eq!(body["details"]["reason"], "propagation_not_granted");
}
