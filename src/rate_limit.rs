//! Per-client request throttling.
//!
//! A fixed-window counter per (client address, tier), held in a shared
//! in-process table. Verification and submission share the strict tier;
//! ballot reads get a more generous one. The table is swept periodically
//! from a background task so it cannot grow without bound.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rocket::{
    fairing::{Fairing, Info, Kind},
    request::{self, FromRequest, Request},
    tokio, Build, Orbit, Rocket,
};

use crate::error::{Error, Result};
use crate::Config;

/// Which limit applies to an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Mutating entry points: verification and vote submission.
    Strict,
    /// Read-only endpoints such as ballot assembly.
    Read,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// A concurrently-safe counter table. Cloning shares the underlying table,
/// so the sweeper task and every request guard observe the same counts.
#[derive(Clone)]
pub struct RateLimiter {
    window: Duration,
    strict_limit: u32,
    read_limit: u32,
    table: Arc<Mutex<HashMap<(IpAddr, Tier), Window>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, strict_limit: u32, read_limit: u32) -> Self {
        Self {
            window,
            strict_limit,
            read_limit,
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.rate_limit_window(),
            config.rate_limit_strict(),
            config.rate_limit_read(),
        )
    }

    fn limit(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Strict => self.strict_limit,
            Tier::Read => self.read_limit,
        }
    }

    /// Count one request from `client` against `tier`.
    ///
    /// A cheap synchronous check: the lock is held only to bump one counter,
    /// never across I/O. On breach, reports how long the caller must wait.
    pub fn check(&self, client: IpAddr, tier: Tier) -> Result<()> {
        let now = Instant::now();
        let limit = self.limit(tier);
        let mut table = self.table.lock().expect("rate limit table poisoned");
        let window = table.entry((client, tier)).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(window.started) >= self.window {
            window.started = now;
            window.count = 0;
        }
        if window.count < limit {
            window.count += 1;
            Ok(())
        } else {
            let elapsed = now.duration_since(window.started);
            let retry_after = self.window.saturating_sub(elapsed).as_secs().max(1);
            Err(Error::RateLimited { retry_after })
        }
    }

    /// Drop every window old enough to have reset, bounding table memory.
    pub fn sweep(&self) {
        let now = Instant::now();
        let window = self.window;
        let mut table = self.table.lock().expect("rate limit table poisoned");
        table.retain(|_, w| now.duration_since(w.started) < window);
    }

    #[cfg(test)]
    fn tracked_clients(&self) -> usize {
        self.table.lock().unwrap().len()
    }
}

/// The requesting client's address, for rate limiting purposes.
///
/// Falls back to the unspecified address when the transport provides none
/// (e.g. the local test client), so such requests share one bucket.
pub struct ClientAddr(pub IpAddr);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientAddr {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        let addr = req
            .client_ip()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        request::Outcome::Success(ClientAddr(addr))
    }
}

/// A fairing that builds the limiter from config at ignition and spawns the
/// periodic sweep task at liftoff. Must be attached after the config fairing.
pub struct RateLimitFairing;

#[rocket::async_trait]
impl Fairing for RateLimitFairing {
    fn info(&self) -> Info {
        Info {
            name: "Rate Limiter",
            kind: Kind::Ignite | Kind::Liftoff,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let config = match rocket.state::<Config>() {
            Some(config) => config,
            None => {
                error!("Config was not available when building the rate limiter");
                return Err(rocket);
            }
        };
        let limiter = RateLimiter::from_config(config);
        Ok(rocket.manage(limiter))
    }

    async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
        let limiter = rocket
            .state::<RateLimiter>()
            .expect("RateLimiter is managed by on_ignite")
            .clone();
        let period = limiter.window;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick fires immediately and sweeps an empty table.
            loop {
                interval.tick().await;
                limiter.sweep();
            }
        });
        info!("Rate limit sweeper running every {period:?}");
    }
}
