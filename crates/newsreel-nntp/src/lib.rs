//! # newsreel-nntp - NNTP wire client and provider pooling
//!
//! The connection fabric under the streaming core:
//!
//! - [`NntpClient`]: one multiplexed connection speaking the command set the
//!   loader needs (AUTHINFO, GROUP, BODY, STAT), with per-operation
//!   deadlines and reconnect-and-replay recovery
//! - [`ConnectionPool`]: per-provider budgeted pooling with an idle deque
//!   and a background reaper
//! - [`PoolSet`]: priority-ordered providers with spillover acquisition
//!
//! ## Concurrency shape
//!
//! A pool's budget is a semaphore whose held permits are open connections;
//! idle clients sit in a deque and are preferred over dialing. At any point
//! `idle + handed_out == max_connections − available_permits`. Blocking
//! acquisition waits on whichever arrives first, an idle client or a free
//! slot, and every wait point also selects on the caller's cancellation
//! token.
//!
//! ## Example
//!
//! ```rust,no_run
//! use newsreel_nntp::{PoolSet, ProviderConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pools = PoolSet::from_configs(vec![ProviderConfig {
//!         name: "primary".into(),
//!         host: "news.example.com".into(),
//!         port: 563,
//!         tls: true,
//!         username: Some("user".into()),
//!         password: Some("pass".into()),
//!         max_connections: 20,
//!     }]);
//!
//!     let token = CancellationToken::new();
//!     let mut tried = vec![false; pools.len()];
//!     if let Some((idx, mut client, guard)) = pools.acquire(&mut tried, &token).await? {
//!         let body = client.body("part1of137@news.example").await?;
//!         println!("fetched {} encoded bytes", body.len());
//!         pools.pools()[idx].put(client, guard);
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod pool;
pub mod response;

#[cfg(any(test, feature = "test-server"))]
pub mod testing;

pub use client::{NntpClient, OPERATION_TIMEOUT, STAT_TIMEOUT};
pub use config::ProviderConfig;
pub use error::{NntpError, Result};
pub use pool::{ConnectionPool, PoolSet, PoolStats, SlotGuard};
pub use response::Response;
