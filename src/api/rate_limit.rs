//! Per-IP request gate.
//!
//! Counts requests per client IP over a fixed window. The request that pushes an IP
//! over the limit is rejected with `429 Too Many Requests` and the IP is then blocked
//! for [`BLOCK_DURATION`], during which every request gets `403 Forbidden`.

use std::{
    future::{ready, Ready},
    net::IpAddr,
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use actix_web::{
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures_util::future::LocalBoxFuture;
use tracing::warn;

use crate::config::Config;

pub const BLOCK_DURATION: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    /// This request exceeded the limit; the IP is now blocked.
    Exceeded,
    Blocked,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    window_start: Instant,
    count: u64,
    blocked_until: Option<Instant>,
    verdict: Verdict,
}

impl Entry {
    fn first(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 1,
            blocked_until: None,
            verdict: Verdict::Allowed,
        }
    }
}

#[derive(Clone)]
pub struct IpGate {
    max_requests: u64,
    window: Duration,
    entries: Arc<papaya::HashMap<IpAddr, Entry>>,
}

impl IpGate {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            entries: Arc::new(papaya::HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.rate_limit_max_requests(), config.rate_limit_window())
    }

    /// Records one request from `ip` at `now`.
    pub fn check(&self, ip: IpAddr, now: Instant) -> Verdict {
        let entries = self.entries.pin();

        entries
            .update_or_insert_with(ip, |entry| self.next(entry, now), || Entry::first(now))
            .verdict
    }

    fn next(&self, entry: &Entry, now: Instant) -> Entry {
        if let Some(until) = entry.blocked_until {
            if now < until {
                return Entry {
                    verdict: Verdict::Blocked,
                    ..*entry
                };
            }
            return Entry::first(now);
        }

        if now.duration_since(entry.window_start) >= self.window {
            return Entry::first(now);
        }

        let count = entry.count + 1;
        if count > self.max_requests {
            return Entry {
                count,
                blocked_until: Some(now + BLOCK_DURATION),
                verdict: Verdict::Exceeded,
                ..*entry
            };
        }

        Entry {
            count,
            verdict: Verdict::Allowed,
            ..*entry
        }
    }
}

impl<S: 'static, B> Transform<S, ServiceRequest> for IpGate
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = IpGateMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(IpGateMiddleware {
            service: Rc::new(service),
            gate: self.clone(),
        }))
    }
}

pub struct IpGateMiddleware<S> {
    service: Rc<S>,
    gate: IpGate,
}

impl<S, B> Service<ServiceRequest> for IpGateMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    actix_web::dev::forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let svc = Rc::clone(&self.service);

        // Requests without a peer address (e.g. unix sockets) are not gated.
        let verdict = req
            .peer_addr()
            .map(|addr| (addr.ip(), self.gate.check(addr.ip(), Instant::now())));

        Box::pin(async move {
            match verdict {
                Some((ip, Verdict::Exceeded)) => {
                    warn!(%ip, "request limit exceeded, blocking client");
                    Err(crate::error::Error::RateLimited { ip: ip.to_string() }.into())
                }
                Some((ip, Verdict::Blocked)) => {
                    Err(crate::error::Error::Blocked { ip: ip.to_string() }.into())
                }
                _ => svc.call(req).await,
            }
        })
    }
}
