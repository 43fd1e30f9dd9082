use super::*;
use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Clone, Debug)]
enum Outcome {
    Allow,
    Deny,
    Fail,
}

/// An evaluator that returns a fixed outcome and counts its invocations.
#[derive(Debug)]
struct Fixed {
    outcome: Outcome,
    calls: AtomicUsize,
}

impl Fixed {
    fn new(outcome: Outcome) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl VerifyIdentity for Fixed {
    async fn call(&self, _: &PipelineState) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.outcome {
            Outcome::Allow => Ok(json!({"sub": "ada"})),
            _ => Err(anyhow!("invalid credential")),
        }
    }
}

#[async_trait::async_trait]
impl FetchMetadata for Fixed {
    async fn call(&self, _: &PipelineState) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.outcome {
            Outcome::Allow => Ok(json!({"tier": "gold"})),
            _ => Err(anyhow!("metadata source unavailable")),
        }
    }
}

#[async_trait::async_trait]
impl Authorize for Fixed {
    async fn call(&self, _: &PipelineState) -> Result<Verdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.outcome {
            Outcome::Allow => Ok(Verdict::Allow),
            Outcome::Deny => Ok(Verdict::Deny(Some("nope".to_string()))),
            Outcome::Fail => Err(anyhow!("script exploded")),
        }
    }
}

/// Authorizes only when the named metadata was fetched.
struct RequiresMetadata(&'static str);

#[async_trait::async_trait]
impl Authorize for RequiresMetadata {
    async fn call(&self, state: &PipelineState) -> Result<Verdict> {
        match state.metadata(self.0) {
            Some(_) => Ok(Verdict::Allow),
            None => Ok(Verdict::Deny(state.metadata_error(self.0).map(String::from))),
        }
    }
}

struct Slow;

#[async_trait::async_trait]
impl Authorize for Slow {
    async fn call(&self, _: &PipelineState) -> Result<Verdict> {
        time::sleep(Duration::from_secs(60)).await;
        Ok(Verdict::Allow)
    }
}

fn request() -> AuthRequest {
    AuthRequest::new("echo-api", "GET", "/allow")
}

/// Enumerates every sequence of outcomes up to `max_len` evaluators long.
fn sequences(max_len: usize) -> Vec<Vec<Outcome>> {
    let mut all = vec![vec![]];
    let mut frontier = vec![vec![]];
    for _ in 0..max_len {
        let mut next = Vec::new();
        for seq in &frontier {
            for outcome in [Outcome::Allow, Outcome::Deny, Outcome::Fail] {
                let mut s: Vec<Outcome> = seq.clone();
                s.push(outcome);
                next.push(s);
            }
        }
        all.extend(next.iter().cloned());
        frontier = next;
    }
    all
}

#[tokio::test]
async fn authorization_requires_every_evaluator_to_allow() {
    for seq in sequences(3) {
        let evaluators = seq.iter().cloned().map(Fixed::new).collect::<Vec<_>>();
        let pipeline = evaluators
            .iter()
            .enumerate()
            .fold(AuthPipeline::builder(), |b, (i, e)| {
                b.authorization(format!("authz-{i}"), e.clone())
            })
            .build();

        let decision = pipeline.evaluate(request()).await;

        let first_refusal = seq.iter().position(|o| !matches!(o, Outcome::Allow));
        match first_refusal {
            None => assert_eq!(decision, Decision::Allow { identity: None }, "{seq:?}"),
            Some(i) => {
                let Decision::Deny(denial) = decision else {
                    panic!("expected a denial for {seq:?}");
                };
                assert_eq!(denial.evaluator, Some(format!("authz-{i}")), "{seq:?}");
                let expected = match seq[i] {
                    Outcome::Deny => DenialKind::PermissionDenied,
                    _ => DenialKind::Internal,
                };
                assert_eq!(denial.kind, expected, "{seq:?}");
            }
        }

        let stop = first_refusal.unwrap_or(seq.len());
        for (i, e) in evaluators.iter().enumerate() {
            let expected = if i <= stop { 1 } else { 0 };
            assert_eq!(e.calls(), expected, "evaluator {i} of {seq:?}");
        }
    }
}

#[tokio::test]
async fn denial_reports_the_first_reason() {
    let pipeline = AuthPipeline::builder()
        .authorization("main-policy", Fixed::new(Outcome::Allow))
        .authorization("some-extra-rules", Fixed::new(Outcome::Deny))
        .authorization("last", Fixed::new(Outcome::Fail))
        .build();

    assert_eq!(
        pipeline.evaluate(request()).await,
        Decision::Deny(Denial {
            kind: DenialKind::PermissionDenied,
            evaluator: Some("some-extra-rules".to_string()),
            reason: "nope".to_string(),
        })
    );
}

#[tokio::test]
async fn identity_short_circuits_on_first_success() {
    for seq in sequences(3).into_iter().filter(|s| !s.is_empty()) {
        let identities = seq.iter().cloned().map(Fixed::new).collect::<Vec<_>>();
        let metadata = Fixed::new(Outcome::Allow);
        let pipeline = identities
            .iter()
            .enumerate()
            .fold(AuthPipeline::builder(), |b, (i, e)| {
                b.identity(format!("id-{i}"), e.clone())
            })
            .metadata("userinfo", metadata.clone())
            .build();

        let decision = pipeline.evaluate(request()).await;

        let first_success = seq.iter().position(|o| matches!(o, Outcome::Allow));
        match first_success {
            Some(i) => {
                assert_eq!(
                    decision,
                    Decision::Allow {
                        identity: Some(format!("id-{i}"))
                    },
                    "{seq:?}"
                );
                assert_eq!(metadata.calls(), 1, "{seq:?}");
                for (j, e) in identities.iter().enumerate() {
                    assert_eq!(e.calls(), usize::from(j <= i), "identity {j} of {seq:?}");
                }
            }
            None => {
                let Decision::Deny(denial) = decision else {
                    panic!("expected a denial for {seq:?}");
                };
                assert_eq!(denial.kind, DenialKind::Unauthenticated);
                assert_eq!(metadata.calls(), 0, "metadata ran for {seq:?}");
                assert!(identities.iter().all(|e| e.calls() == 1));
            }
        }
    }
}

#[tokio::test]
async fn metadata_failures_do_not_abort() {
    let first = Fixed::new(Outcome::Fail);
    let second = Fixed::new(Outcome::Allow);
    let pipeline = AuthPipeline::builder()
        .identity("keycloak", Fixed::new(Outcome::Allow))
        .metadata("userinfo", first.clone())
        .metadata("resource-data", second.clone())
        .authorization("needs-resource-data", Arc::new(RequiresMetadata("resource-data")))
        .build();
    assert_eq!(
        pipeline.evaluate(request()).await,
        Decision::Allow {
            identity: Some("keycloak".to_string())
        }
    );
    assert_eq!((first.calls(), second.calls()), (1, 1));

    let pipeline = AuthPipeline::builder()
        .identity("keycloak", Fixed::new(Outcome::Allow))
        .metadata("userinfo", Fixed::new(Outcome::Fail))
        .authorization("needs-userinfo", Arc::new(RequiresMetadata("userinfo")))
        .build();
    assert_eq!(
        pipeline.evaluate(request()).await,
        Decision::Deny(Denial {
            kind: DenialKind::PermissionDenied,
            evaluator: Some("needs-userinfo".to_string()),
            reason: "metadata source unavailable".to_string(),
        })
    );
}

#[tokio::test(start_paused = true)]
async fn deadline_denies() {
    let after = Fixed::new(Outcome::Allow);
    let pipeline = AuthPipeline::builder()
        .authorization("slow", Arc::new(Slow))
        .authorization("after", after.clone())
        .timeout(Duration::from_secs(1))
        .build();

    let Decision::Deny(denial) = pipeline.evaluate(request()).await else {
        panic!("expected a timeout");
    };
    assert_eq!(denial.kind, DenialKind::Timeout);
    assert_eq!(after.calls(), 0);
}

#[test]
fn authorization_json_layout() {
    let mut state = PipelineState::new(
        request()
            .with_header("X-Forwarded-For", "80.133.21.75")
            .with_source(([80, 133, 21, 75], 45000).into())
            .with_destination(([10, 0, 0, 7], 8080).into()),
    );
    state.identity = Some(("keycloak".to_string(), json!({"sub": "ada"})));
    state
        .metadata
        .insert("userinfo".to_string(), json!({"email": "ada@example.com"}));

    assert_eq!(
        state.authorization_json(),
        json!({
            "request": {
                "host": "echo-api",
                "method": "GET",
                "path": "/allow",
                "scheme": "http",
                "headers": {"x-forwarded-for": "80.133.21.75"},
            },
            "source": {"address": "80.133.21.75", "port": 45000},
            "destination": {"address": "10.0.0.7", "port": 8080},
            "auth": {
                "identity": {"sub": "ada"},
                "metadata": {"userinfo": {"email": "ada@example.com"}},
                "authorization": {},
            },
        })
    );
}
