//! License gate
//!
//! ## Overview
//! - Periodic validation against the external license service
//! - Cached verdict with TTL and last-known-good grace fallback
//! - Synchronous admission check invoked before quota-raising mutations
//!
//! On prolonged outage the gate degrades: within the grace window it serves
//! the last-known-good verdict; after grace every quota-raising mutation is
//! denied while already-running proxies stay untouched.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ControlError, Result};
use crate::types::Tier;

/// Fleet-wide proxy allowance for unlicensed community clusters.
pub const COMMUNITY_PROXY_LIMIT: u32 = 3;

const FETCH_ATTEMPTS: u32 = 2;
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// The validator's decision: tier, quota, and feature flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseVerdict {
    pub tier: Tier,
    pub max_proxies: u32,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl LicenseVerdict {
    /// Built-in verdict used when no license endpoint is configured.
    pub fn community() -> Self {
        LicenseVerdict {
            tier: Tier::Community,
            max_proxies: COMMUNITY_PROXY_LIMIT,
            features: Vec::new(),
            expires_at: None,
        }
    }
}

/// Freshness of the verdict backing a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictState {
    Fresh,
    Grace,
    Degraded,
}

#[derive(Debug, Clone)]
pub struct CheckedVerdict {
    pub verdict: LicenseVerdict,
    pub state: VerdictState,
}

/// Mutation classes that can raise licensed resource usage.
#[derive(Debug, Clone)]
pub enum LicenseRequest {
    RegisterProxy { admitted: u32 },
    CreateCluster { tier: Tier },
    EnableFeature(String),
}

struct CachedVerdict {
    verdict: LicenseVerdict,
    fetched_at: Instant,
}

pub struct LicenseGate {
    http: reqwest::Client,
    endpoint: Option<Url>,
    ttl: Duration,
    grace: Duration,
    cached: ArcSwapOption<CachedVerdict>,
}

impl LicenseGate {
    pub fn new(
        endpoint: Option<String>,
        timeout: Duration,
        ttl: Duration,
        grace: Duration,
    ) -> Result<Self> {
        let endpoint = endpoint
            .map(|e| {
                Url::parse(&e).map_err(|err| {
                    ControlError::invalid_field("license_endpoint", format!("invalid URL: {err}"))
                })
            })
            .transpose()?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ControlError::Internal(format!("license client: {e}")))?;
        Ok(LicenseGate {
            http,
            endpoint,
            ttl,
            grace,
            cached: ArcSwapOption::empty(),
        })
    }

    /// Current verdict plus its freshness. Never errors: outages downgrade
    /// to grace or degraded per policy.
    pub async fn current(&self) -> CheckedVerdict {
        let Some(endpoint) = &self.endpoint else {
            return CheckedVerdict {
                verdict: LicenseVerdict::community(),
                state: VerdictState::Fresh,
            };
        };

        if let Some(cached) = self.cached.load_full() {
            if cached.fetched_at.elapsed() < self.ttl {
                counter!("fleetplane_license_cache_hits_total").increment(1);
                return CheckedVerdict {
                    verdict: cached.verdict.clone(),
                    state: VerdictState::Fresh,
                };
            }
        }

        match self.fetch(endpoint).await {
            Ok(verdict) => {
                self.cached.store(Some(Arc::new(CachedVerdict {
                    verdict: verdict.clone(),
                    fetched_at: Instant::now(),
                })));
                CheckedVerdict {
                    verdict,
                    state: VerdictState::Fresh,
                }
            }
            Err(err) => {
                counter!("fleetplane_license_fetch_failures_total").increment(1);
                warn!(error = %err, "license validation unreachable");
                match self.cached.load_full() {
                    Some(cached) if cached.fetched_at.elapsed() < self.ttl + self.grace => {
                        counter!("fleetplane_license_stale_verdicts_total").increment(1);
                        CheckedVerdict {
                            verdict: cached.verdict.clone(),
                            state: VerdictState::Grace,
                        }
                    }
                    _ => CheckedVerdict {
                        verdict: LicenseVerdict::community(),
                        state: VerdictState::Degraded,
                    },
                }
            }
        }
    }

    async fn fetch(&self, endpoint: &Url) -> Result<LicenseVerdict> {
        let mut last_err = None;
        for attempt in 0..FETCH_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            match self.fetch_once(endpoint).await {
                Ok(verdict) => return Ok(verdict),
                Err(err) => {
                    debug!(attempt, error = %err, "license fetch attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ControlError::Unavailable("license fetch".into())))
    }

    async fn fetch_once(&self, endpoint: &Url) -> Result<LicenseVerdict> {
        let response = self.http.get(endpoint.clone()).send().await?;
        if !response.status().is_success() {
            return Err(ControlError::Unavailable(format!(
                "license service returned {}",
                response.status()
            )));
        }
        let verdict: LicenseVerdict = response
            .json()
            .await
            .map_err(|e| ControlError::Unavailable(format!("license response: {e}")))?;
        if let Some(expires_at) = verdict.expires_at {
            if expires_at <= Utc::now() {
                return Err(ControlError::Quota("license expired".into()));
            }
        }
        Ok(verdict)
    }

    /// Admission check run before any mutation that could raise licensed
    /// resource usage.
    pub async fn check(&self, cluster_id: &str, request: LicenseRequest) -> Result<()> {
        let checked = self.current().await;
        if checked.state == VerdictState::Degraded && self.endpoint.is_some() {
            counter!("fleetplane_license_denials_total", "reason" => "degraded").increment(1);
            return Err(ControlError::Degraded(
                "license grace expired; privileged mutations denied".into(),
            ));
        }
        let outcome = match &request {
            LicenseRequest::RegisterProxy { admitted } => {
                if *admitted < checked.verdict.max_proxies {
                    Ok(())
                } else {
                    Err(ControlError::Quota(format!(
                        "cluster {cluster_id} at licensed proxy limit {}",
                        checked.verdict.max_proxies
                    )))
                }
            }
            LicenseRequest::CreateCluster { tier } => match tier {
                Tier::Community => Ok(()),
                Tier::Enterprise if checked.verdict.tier == Tier::Enterprise => Ok(()),
                Tier::Enterprise if checked.state == VerdictState::Grace => {
                    Err(ControlError::Unavailable(
                        "license service unreachable; enterprise tier unconfirmed".into(),
                    ))
                }
                Tier::Enterprise => {
                    Err(ControlError::Quota("enterprise tier not licensed".into()))
                }
            },
            LicenseRequest::EnableFeature(feature) => {
                if checked.verdict.features.iter().any(|f| f == feature) {
                    Ok(())
                } else if checked.state == VerdictState::Grace {
                    Err(ControlError::Unavailable(
                        "license service unreachable; feature unconfirmed".into(),
                    ))
                } else {
                    Err(ControlError::Quota(format!("feature `{feature}` not licensed")))
                }
            }
        };
        if let Err(err) = &outcome {
            counter!("fleetplane_license_denials_total", "reason" => err.kind().to_string())
                .increment(1);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_gate_serves_community_verdict() {
        let gate = LicenseGate::new(
            None,
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::from_secs(60),
        )
        .unwrap();
        let checked = gate.current().await;
        assert_eq!(checked.state, VerdictState::Fresh);
        assert_eq!(checked.verdict.max_proxies, COMMUNITY_PROXY_LIMIT);

        assert!(gate
            .check("c1", LicenseRequest::RegisterProxy { admitted: 2 })
            .await
            .is_ok());
        let err = gate
            .check("c1", LicenseRequest::RegisterProxy { admitted: 3 })
            .await
            .unwrap_err();
        assert!(err.is_quota());
    }

    #[tokio::test]
    async fn community_gate_rejects_enterprise_tier() {
        let gate = LicenseGate::new(
            None,
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::from_secs(60),
        )
        .unwrap();
        let err = gate
            .check(
                "c1",
                LicenseRequest::CreateCluster {
                    tier: Tier::Enterprise,
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_quota());
    }
}
