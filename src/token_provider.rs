/// Supplies bearer tokens for authenticated requests. OAuth itself — the authorization
/// code exchange, refresh scheduling, token storage — lives entirely on the caller's
/// side; this trait is the only seam the pipeline needs.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self, character_id: u64) -> Result<Option<String>, anyhow::Error>;
}

/// Used when a client is constructed before a real provider is wired up, or for
/// endpoints that never require auth. Every lookup reports "no token available",
/// which the pipeline treats as an auth failure for requests that need one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTokenProvider;

#[async_trait::async_trait]
impl TokenProvider for NoTokenProvider {
    async fn access_token(&self, _character_id: u64) -> Result<Option<String>, anyhow::Error> {
        Ok(None)
    }
}
