//! Transport Diagnostics
//!
//! Turns periodic cumulative byte counters per peer into throughput figures
//! and summarizes the state of each peer-to-peer channel.
//!
//! Only one sample of history is kept per `(step, peer)`: the rate is simply
//! the delta against the previous poll.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::flow::model::email_key;

/// Connection state of a peer channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Connected,
    Establishing,
    Waiting,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Establishing => "establishing",
            Self::Waiting => "waiting",
        }
    }
}

/// Point-in-time state of one peer channel. Never cached by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerChannelSample {
    pub channel_id: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Whether the channel's marker file exists
    #[serde(default)]
    pub marker: bool,
    /// Whether the remote side accepted
    #[serde(default)]
    pub accept: bool,
    #[serde(default)]
    pub listener_up: Option<bool>,
    #[serde(default)]
    pub requests: usize,
    #[serde(default)]
    pub responses: usize,
}

impl PeerChannelSample {
    /// Derives the channel state from its raw evidence.
    pub fn state(&self) -> ChannelState {
        if self.listener_up == Some(true) {
            ChannelState::Connected
        } else if self.marker || self.accept {
            ChannelState::Establishing
        } else {
            ChannelState::Waiting
        }
    }

    /// One-line summary for log views.
    pub fn summary(&self) -> String {
        let port = self
            .port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "n/a".to_string());
        let listener = match self.listener_up {
            Some(true) => "up",
            Some(false) => "down",
            None => "unknown",
        };
        format!(
            "{} {} port={} listener={} requests={} responses={}",
            self.channel_id,
            self.state().as_str(),
            port,
            listener,
            self.requests,
            self.responses
        )
    }
}

/// Cumulative byte counters reported for one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerByteSample {
    pub peer_email: String,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub observed_at: DateTime<Utc>,
    /// Average send latency reported alongside the counters
    #[serde(default)]
    pub avg_send_ms: Option<f64>,
    /// When the peer last refreshed its telemetry
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PeerByteSample {
    pub fn new(peer_email: impl Into<String>, tx_bytes: u64, rx_bytes: u64, observed_at: DateTime<Utc>) -> Self {
        Self {
            peer_email: peer_email.into(),
            tx_bytes,
            rx_bytes,
            observed_at,
            avg_send_ms: None,
            updated_at: None,
        }
    }
}

/// Everything the host reports about a step's transport in one poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportSnapshot {
    #[serde(default)]
    pub channels: Vec<PeerChannelSample>,
    #[serde(default)]
    pub peers: Vec<PeerByteSample>,
}

/// Instantaneous throughput for one peer, in bytes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerRate {
    pub tx_rate: f64,
    pub rx_rate: f64,
}

/// One-sample-history rate estimator keyed by `(step, peer)`.
#[derive(Debug, Clone, Default)]
pub struct RateEstimator {
    last: HashMap<(String, String), PeerByteSample>,
}

impl RateEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes per-peer rates against the previous sample, then keeps the
    /// new samples as the next baseline.
    ///
    /// A peer seen for the first time reports a rate of zero. Counter resets
    /// clamp to zero rather than going negative.
    pub fn rate(&mut self, step_id: &str, samples: &[PeerByteSample]) -> HashMap<String, PeerRate> {
        let mut rates = HashMap::new();

        for sample in samples {
            let key = (step_id.to_string(), email_key(&sample.peer_email));

            let rate = match self.last.get(&key) {
                Some(prev) => {
                    let elapsed_ms = (sample.observed_at - prev.observed_at)
                        .num_milliseconds()
                        .max(1) as f64;
                    PeerRate {
                        tx_rate: sample.tx_bytes.saturating_sub(prev.tx_bytes) as f64 * 1000.0
                            / elapsed_ms,
                        rx_rate: sample.rx_bytes.saturating_sub(prev.rx_bytes) as f64 * 1000.0
                            / elapsed_ms,
                    }
                }
                None => PeerRate::default(),
            };

            self.last.insert(key, sample.clone());
            rates.insert(sample.peer_email.clone(), rate);
        }

        rates
    }
}
