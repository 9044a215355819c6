//! Token-bucket rate limiting.
//!
//! REST requests are budgeted per client IP by [`rate_limit_middleware`].
//! Inbound `new-message` events are budgeted per user; the socket layer
//! calls [`RateLimiter::allow`] itself and answers with an `error` event.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::RateSettings;

/// Remaining budget of one key.
#[derive(Debug, Clone, Copy)]
struct Allowance {
    tokens: f64,
    touched: Instant,
}

impl Allowance {
    fn full(settings: RateSettings, now: Instant) -> Self {
        Self {
            tokens: settings.burst,
            touched: now,
        }
    }

    /// Refill for the time since the last touch, then spend one token.
    fn take(&mut self, settings: RateSettings, now: Instant) -> bool {
        let idle = now.saturating_duration_since(self.touched).as_secs_f64();
        self.touched = now;
        self.tokens = (self.tokens + idle * settings.per_sec).min(settings.burst);
        if self.tokens < 1.0 {
            return false;
        }
        self.tokens -= 1.0;
        true
    }
}

/// Shared set of buckets keyed by `K`. Clones share state.
pub struct RateLimiter<K = IpAddr> {
    buckets: Arc<Mutex<HashMap<K, Allowance>>>,
    settings: RateSettings,
}

impl<K> Clone for RateLimiter<K> {
    fn clone(&self) -> Self {
        Self {
            buckets: self.buckets.clone(),
            settings: self.settings,
        }
    }
}

impl<K: Eq + Hash> RateLimiter<K> {
    pub fn new(settings: RateSettings) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            settings,
        }
    }

    /// Spend one token for `key`. `false` means over budget.
    pub async fn allow(&self, key: K) -> bool {
        self.allow_at(key, Instant::now()).await
    }

    async fn allow_at(&self, key: K, now: Instant) -> bool {
        let settings = self.settings;
        self.buckets
            .lock()
            .await
            .entry(key)
            .or_insert_with(|| Allowance::full(settings, now))
            .take(settings, now)
    }

    /// Forget keys untouched for at least `max_idle`. Returns how many.
    pub async fn purge_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, allowance| now.saturating_duration_since(allowance.touched) < max_idle);
        before - buckets.len()
    }
}

/// Reject REST requests over the caller IP's budget with `429`.
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter<IpAddr>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(ip) = client_ip(&req) {
        if !limiter.allow(ip).await {
            warn!(ip = %ip, path = %req.uri().path(), "request rate limit exceeded");
            return Err(StatusCode::TOO_MANY_REQUESTS);
        }
    }
    Ok(next.run(req).await)
}

/// Peer address when known, else the first `X-Forwarded-For` hop, else
/// `X-Real-IP`.
fn client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return Some(addr.ip());
    }
    let header = |name: &str| req.headers().get(name).and_then(|v| v.to_str().ok());
    header("x-forwarded-for")
        .and_then(|chain| chain.split(',').next())
        .and_then(|hop| hop.trim().parse::<IpAddr>().ok())
        .or_else(|| header("x-real-ip").and_then(|v| v.trim().parse::<IpAddr>().ok()))
}
