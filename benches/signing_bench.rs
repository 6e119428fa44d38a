//! End-to-end gateway benchmarks against the software HSM.
//!
//! Run with: cargo bench --bench signing_bench

use std::sync::Arc;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use eks_gateway::config::TokenConfig;
use eks_gateway::types::{KeyAlgorithm, KeyId, LifecycleAction};
use eks_gateway::{Gateway, GatewayConfig, RequestAction, RequestEnvelope, Scope, SoftwareHsm};
use sha2::{Digest, Sha256};
use tokio::runtime::Runtime;

const CREDENTIAL: &str = "Bearer bench-token";

fn config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.auth.tokens = vec![TokenConfig {
        token: "bench-token".into(),
        tenant_id: "bench".into(),
        scopes: vec![Scope::KeyOperation, Scope::KeyManagement],
        expires_at: None,
    }];
    config
}

fn envelope(request_id: String, action: RequestAction) -> RequestEnvelope {
    RequestEnvelope {
        request_id,
        credential: Some(CREDENTIAL.into()),
        action,
        requested_at: Utc::now(),
        envelope_signature: None,
    }
}

fn provision(rt: &Runtime, gateway: &Gateway, algorithm: KeyAlgorithm) -> KeyId {
    let action = RequestAction::Lifecycle(LifecycleAction::GenerateKey { algorithm, label: None });
    let response = rt.block_on(gateway.handle(envelope(format!("gen-{}", algorithm), action)));
    response.key.expect("key generated").key_id
}

/// Fresh request ids: claim, lease, HSM call, commit and audit.
fn bench_sign(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let gateway = rt
        .block_on(Gateway::open(config(), Arc::new(SoftwareHsm::ephemeral())))
        .expect("gateway");
    let digest = hex::encode(Sha256::digest(b"benchmark payload"));

    let mut group = c.benchmark_group("gateway_sign");
    for algorithm in [KeyAlgorithm::EcdsaSecp256k1, KeyAlgorithm::EcdsaP256, KeyAlgorithm::EddsaEd25519] {
        let key_id = provision(&rt, &gateway, algorithm);
        let mut i = 0u64;
        group.bench_with_input(BenchmarkId::from_parameter(algorithm), &key_id, |b, key_id| {
            b.iter(|| {
                i += 1;
                let request = envelope(format!("sign-{}-{}", algorithm, i), RequestAction::sign(key_id.clone(), digest.clone()));
                black_box(rt.block_on(gateway.handle(request)))
            })
        });
    }
    group.finish();
}

/// Redelivery of a committed request id.
fn bench_replay(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let gateway = rt
        .block_on(Gateway::open(config(), Arc::new(SoftwareHsm::ephemeral())))
        .expect("gateway");
    let key_id = provision(&rt, &gateway, KeyAlgorithm::EcdsaP256);
    let digest = hex::encode(Sha256::digest(b"replayed payload"));
    let request = envelope("replayed".into(), RequestAction::sign(key_id, digest));
    rt.block_on(gateway.handle(request.clone()));

    c.bench_function("gateway_replay", |b| {
        b.iter(|| black_box(rt.block_on(gateway.handle(request.clone()))))
    });
}

criterion_group!(benches, bench_sign, bench_replay);
criterion_main!(benches);
