//! Threat tiers and aggregate statistics over the latest decisions.

use std::fmt;

use super::Decision;

/// Severity bucket derived from a threat score, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreatTier {
    Quarantine,
    High,
    Elevated,
    Safe,
    Trusted,
}

/// Scores at or above this are quarantined regardless of the verdict.
pub const QUARANTINE_THRESHOLD: u8 = 85;
const HIGH_THRESHOLD: u8 = 65;
const ELEVATED_THRESHOLD: u8 = 45;
const SAFE_THRESHOLD: u8 = 20;

/// Maps a score in `[0, 100]` to its tier.
pub fn classify(score: u8) -> ThreatTier {
    if score >= QUARANTINE_THRESHOLD {
        ThreatTier::Quarantine
    } else if score >= HIGH_THRESHOLD {
        ThreatTier::High
    } else if score >= ELEVATED_THRESHOLD {
        ThreatTier::Elevated
    } else if score >= SAFE_THRESHOLD {
        ThreatTier::Safe
    } else {
        ThreatTier::Trusted
    }
}

impl ThreatTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatTier::Quarantine => "quarantine",
            ThreatTier::High => "high",
            ThreatTier::Elevated => "elevated",
            ThreatTier::Safe => "safe",
            ThreatTier::Trusted => "trusted",
        }
    }
}

impl fmt::Display for ThreatTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Share of allowed decisions, in percent. No data counts as fully compliant.
pub fn compliance_percent(allowed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (100.0 * allowed as f64 / total as f64).round() as u8
}

/// Aggregates shown on the watchtower summary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskSummary {
    pub total: usize,
    pub allowed: usize,
    pub denied: usize,
    pub quarantined: usize,
    pub average_threat: u8,
    pub max_threat: u8,
    /// First entry of the input, i.e. the newest when fed reducer output.
    pub last_decision: Option<Decision>,
}

impl RiskSummary {
    pub fn from_latest(latest: &[Decision]) -> Self {
        if latest.is_empty() {
            return Self::default();
        }

        let mut summary = Self {
            total: latest.len(),
            last_decision: latest.first().cloned(),
            ..Self::default()
        };
        let mut sum: u64 = 0;

        for d in latest {
            if d.is_allowed() {
                summary.allowed += 1;
            } else {
                summary.denied += 1;
            }
            if d.threat_score >= QUARANTINE_THRESHOLD {
                summary.quarantined += 1;
            }
            sum += u64::from(d.threat_score);
            summary.max_threat = summary.max_threat.max(d.threat_score);
        }

        summary.average_threat = (sum as f64 / latest.len() as f64).round() as u8;
        summary
    }

    pub fn compliance_percent(&self) -> u8 {
        compliance_percent(self.allowed, self.total)
    }

    /// One-line posture summary.
    pub fn insight(&self) -> String {
        if self.total == 0 {
            return "No Guardian activity yet.".to_string();
        }
        if self.quarantined > 0 {
            return format!(
                "Quarantine triggered for {} module run(s).",
                self.quarantined
            );
        }
        match self.average_threat {
            0..=20 => "Threat posture is low — system stable.",
            21..=45 => "Threat posture is moderate.",
            46..=65 => "Threat posture is elevated — monitor closely.",
            _ => "Threat posture is high — immediate review recommended.",
        }
        .to_string()
    }
}
