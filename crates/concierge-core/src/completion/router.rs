//! Completion failover across backends

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CompletionHttpError, CompletionOptions, CompletionService};

/// Message fragments that mark a transient failure on backends without typed errors
const TRANSIENT_HINTS: &[&str] = &["rate limit", "overloaded", "timed out", "temporarily unavailable"];

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    /// Same backend again after backoff
    Retry,
    /// Give up on this backend and move to the next one
    Failover,
}

/// Tries completion backends in order.
///
/// Transient failures (429/5xx, connect errors, attempt timeouts) are retried
/// on the same backend with exponential backoff. Anything else, including an
/// empty completion, moves straight to the next backend.
pub struct FailoverCompletion {
    /// Backends in failover order (index 0 = primary)
    providers: Vec<Box<dyn CompletionService>>,
    attempts_per_provider: u32,
    base_retry_delay: Duration,
    attempt_timeout: Option<Duration>,
}

impl FailoverCompletion {
    pub fn new(providers: Vec<Box<dyn CompletionService>>) -> Result<Self> {
        if providers.is_empty() {
            return Err(anyhow!("FailoverCompletion requires at least one provider"));
        }
        Ok(Self {
            providers,
            attempts_per_provider: 2,
            base_retry_delay: Duration::from_millis(500),
            attempt_timeout: None,
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.attempts_per_provider = max_retries.max(1);
        self
    }

    pub fn with_base_retry_delay(mut self, delay: Duration) -> Self {
        self.base_retry_delay = delay;
        self
    }

    /// Bound each single attempt; an attempt that runs over counts as transient
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    async fn attempt(
        &self,
        provider: &dyn CompletionService,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, (anyhow::Error, Next)> {
        let call = provider.complete(prompt, options);
        let outcome = match self.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err((
                        anyhow!("{} gave no completion within {:?}", provider.provider_name(), limit),
                        Next::Retry,
                    ));
                }
            },
            None => call.await,
        };

        match outcome {
            Ok(text) if text.trim().is_empty() => Err((
                anyhow!("{} returned an empty completion", provider.provider_name()),
                Next::Failover,
            )),
            Ok(text) => Ok(text),
            Err(e) => {
                let next = classify(&e);
                Err((e, next))
            }
        }
    }
}

#[async_trait]
impl CompletionService for FailoverCompletion {
    fn provider_name(&self) -> &str {
        self.providers
            .first()
            .map(|p| p.provider_name())
            .unwrap_or("unknown")
    }

    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String> {
        let mut last_error = None;

        for (idx, provider) in self.providers.iter().enumerate() {
            let name = provider.provider_name();
            for attempt in 0..self.attempts_per_provider {
                match self.attempt(provider.as_ref(), prompt, options).await {
                    Ok(text) => {
                        if idx > 0 {
                            info!("Completion for model {} served by failover provider {}", options.model, name);
                        }
                        return Ok(text);
                    }
                    Err((e, next)) => {
                        warn!(
                            "Completion via {} failed (attempt {}/{}, {:?}): {}",
                            name,
                            attempt + 1,
                            self.attempts_per_provider,
                            next,
                            e
                        );
                        last_error = Some(e);
                        if next == Next::Failover || attempt + 1 == self.attempts_per_provider {
                            break;
                        }
                        let delay = self.base_retry_delay * 2u32.pow(attempt);
                        debug!("Retrying {} in {:?}", name, delay);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("All completion providers failed")))
    }
}

fn classify(err: &anyhow::Error) -> Next {
    for cause in err.chain() {
        if let Some(http) = cause.downcast_ref::<CompletionHttpError>() {
            return if http.is_retryable() { Next::Retry } else { Next::Failover };
        }
        if let Some(transport) = cause.downcast_ref::<reqwest::Error>() {
            return if transport.is_timeout() || transport.is_connect() {
                Next::Retry
            } else {
                Next::Failover
            };
        }
    }
    let text = err.to_string().to_lowercase();
    if TRANSIENT_HINTS.iter().any(|hint| text.contains(hint)) {
        Next::Retry
    } else {
        Next::Failover
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        name: String,
        reply: std::result::Result<String, String>,
        calls: Arc<AtomicUsize>,
    }

    impl Fixed {
        fn ok(name: &str, text: &str) -> Self {
            Self {
                name: name.to_string(),
                reply: Ok(text.to_string()),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn err(name: &str, error: &str) -> Self {
            Self {
                name: name.to_string(),
                reply: Err(error.to_string()),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl CompletionService for Fixed {
        fn provider_name(&self) -> &str {
            &self.name
        }

        async fn complete(&self, _prompt: &str, _options: &CompletionOptions) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().map_err(|e| anyhow!(e))
        }
    }

    /// Answers with a typed HTTP status error
    struct Status(u16, Arc<AtomicUsize>);

    #[async_trait]
    impl CompletionService for Status {
        fn provider_name(&self) -> &str {
            "status"
        }

        async fn complete(&self, _prompt: &str, _options: &CompletionOptions) -> Result<String> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Err(CompletionHttpError {
                provider: "status".to_string(),
                status: self.0,
                body: "nope".to_string(),
            }
            .into())
        }
    }

    struct Stalled;

    #[async_trait]
    impl CompletionService for Stalled {
        fn provider_name(&self) -> &str {
            "stalled"
        }

        async fn complete(&self, _prompt: &str, _options: &CompletionOptions) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("too late".to_string())
        }
    }

    fn router(providers: Vec<Box<dyn CompletionService>>, attempts: u32) -> FailoverCompletion {
        FailoverCompletion::new(providers)
            .unwrap()
            .with_max_retries(attempts)
            .with_base_retry_delay(Duration::from_millis(1))
    }

    #[test]
    fn test_empty_providers_rejected() {
        assert!(FailoverCompletion::new(vec![]).is_err());
    }

    #[tokio::test]
    async fn test_failover_to_second_provider() {
        let primary = Fixed::err("primary", "upstream overloaded");
        let calls = primary.calls.clone();
        let router = router(vec![Box::new(primary), Box::new(Fixed::ok("fallback", "from fallback"))], 2);

        let text = router.complete("hi", &CompletionOptions::new("m")).await.unwrap();
        assert_eq!(text, "from fallback");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(router.provider_name(), "primary");
        assert_eq!(router.provider_count(), 2);
    }

    #[tokio::test]
    async fn test_http_status_decides_retry() {
        let throttled = Arc::new(AtomicUsize::new(0));
        let router_429 = router(
            vec![Box::new(Status(429, throttled.clone())), Box::new(Fixed::ok("b", "ok"))],
            3,
        );
        router_429.complete("hi", &CompletionOptions::new("m")).await.unwrap();
        assert_eq!(throttled.load(Ordering::SeqCst), 3);

        let rejected = Arc::new(AtomicUsize::new(0));
        let router_401 = router(
            vec![Box::new(Status(401, rejected.clone())), Box::new(Fixed::ok("b", "ok"))],
            3,
        );
        router_401.complete("hi", &CompletionOptions::new("m")).await.unwrap();
        assert_eq!(rejected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_completion_fails_over_without_retry() {
        let blank = Fixed::ok("blank", "   ");
        let calls = blank.calls.clone();
        let router = router(vec![Box::new(blank), Box::new(Fixed::ok("b", "real answer"))], 3);

        let text = router.complete("hi", &CompletionOptions::new("m")).await.unwrap();
        assert_eq!(text, "real answer");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_moves_on() {
        let router = router(vec![Box::new(Stalled), Box::new(Fixed::ok("b", "on time"))], 2)
            .with_attempt_timeout(Duration::from_millis(20));

        let text = router.complete("hi", &CompletionOptions::new("m")).await.unwrap();
        assert_eq!(text, "on time");
    }

    #[tokio::test]
    async fn test_all_providers_fail() {
        let router = router(
            vec![Box::new(Fixed::err("a", "invalid api key")), Box::new(Fixed::err("b", "invalid api key"))],
            2,
        );
        assert!(router.complete("hi", &CompletionOptions::new("m")).await.is_err());
    }

    #[test]
    fn test_classify_untyped_errors() {
        assert_eq!(classify(&anyhow!("status 429: rate limit exceeded")), Next::Retry);
        assert_eq!(classify(&anyhow!("request timed out")), Next::Retry);
        assert_eq!(classify(&anyhow!("invalid api key")), Next::Failover);
    }
}
