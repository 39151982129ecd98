//! Liquidation-distance risk monitoring.
//!
//! Each leg's risk level is `100 - distance%`, where distance% is how far
//! the mark price sits from the liquidation price, relative to the mark.
//! A mark at or past the liquidation price scores 100.

use crate::bot::session::Leg;
use crate::exchange::{AdapterPair, Side, Venue};
use crate::persistence::Store;
use crate::utils::decimal::safe_div;
use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Severity buckets over the 0-100 risk level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_risk_level(risk_level: Decimal) -> Self {
        if risk_level >= dec!(90) {
            Severity::Critical
        } else if risk_level >= dec!(80) {
            Severity::High
        } else if risk_level >= dec!(50) {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// One leg's risk snapshot for one tick.
#[derive(Debug, Clone)]
pub struct RiskAssessment {
    pub leg_id: String,
    pub venue: Venue,
    pub symbol: String,
    pub risk_level: Decimal,
    pub distance_pct: Decimal,
    pub severity: Severity,
    pub mark_price: Decimal,
    pub liquidation_price: Decimal,
}

/// Compute the risk level of a leg from current venue data.
///
/// Venues omit the liquidation price right after entry; a conservative
/// one is synthesized at 30% adverse movement until the real one shows up.
pub fn assess(leg: &Leg, mark_price: Decimal, liquidation_price: Option<Decimal>) -> RiskAssessment {
    let liquidation_price = liquidation_price.unwrap_or_else(|| match leg.side {
        Side::Long => mark_price * dec!(0.7),
        Side::Short => mark_price * dec!(1.3),
    });

    let raw_distance = match leg.side {
        Side::Long => safe_div(mark_price - liquidation_price, mark_price) * dec!(100),
        Side::Short => safe_div(liquidation_price - mark_price, mark_price) * dec!(100),
    };
    let distance_pct = raw_distance.max(Decimal::ZERO);
    let risk_level = (dec!(100) - distance_pct).max(Decimal::ZERO);

    RiskAssessment {
        leg_id: leg.leg_id.clone(),
        venue: leg.venue,
        symbol: leg.symbol.clone(),
        risk_level,
        distance_pct,
        severity: Severity::from_risk_level(risk_level),
        mark_price,
        liquidation_price,
    }
}

/// Per-tick risk scan over a session's open legs.
pub struct RiskMonitor {
    max_risk_level: Decimal,
}

impl RiskMonitor {
    pub fn new(max_risk_level: Decimal) -> Self {
        Self { max_risk_level }
    }

    /// Whether an assessment crosses the emergency-close ceiling.
    pub fn is_breach(&self, assessment: &RiskAssessment) -> bool {
        assessment.risk_level >= self.max_risk_level
    }

    /// Fetch positions once per venue, score every open leg, persist the
    /// updated risk fields and log events for high-risk legs.
    ///
    /// Legs the venue no longer reports (liquidated or closed out-of-band)
    /// are closed in the store at their last mark price.
    pub async fn check_legs(
        &self,
        adapters: &AdapterPair,
        store: &Store,
        session_id: &str,
    ) -> Result<Vec<RiskAssessment>> {
        let legs = store.get_open_legs(session_id)?;
        if legs.is_empty() {
            return Ok(Vec::new());
        }

        let mut venue_positions = HashMap::new();
        for adapter in adapters.both() {
            let positions = adapter.open_positions(None).await?;
            let by_symbol: HashMap<String, _> = positions
                .into_iter()
                .map(|p| (p.symbol.clone(), p))
                .collect();
            venue_positions.insert(adapter.venue(), by_symbol);
        }

        let mut assessments = Vec::new();
        for leg in &legs {
            let position = venue_positions
                .get(&leg.venue)
                .and_then(|m| m.get(&leg.symbol));

            let Some(position) = position else {
                warn!(
                    leg_id = %leg.leg_id,
                    venue = %leg.venue,
                    symbol = %leg.symbol,
                    "Leg no longer reported by venue, closing in store"
                );
                let pnl = store.close_leg(leg, leg.mark_price)?;
                store.append_risk_event(
                    session_id,
                    "leg_missing",
                    Severity::High.as_str(),
                    &json!({
                        "leg_id": leg.leg_id,
                        "venue": leg.venue,
                        "symbol": leg.symbol,
                        "pnl": pnl.to_string(),
                    }),
                )?;
                continue;
            };

            let assessment = assess(leg, position.mark_price, position.liquidation_price);
            store.update_leg_risk(
                &leg.leg_id,
                assessment.risk_level,
                assessment.mark_price,
                position.liquidation_price,
            )?;

            debug!(
                leg_id = %leg.leg_id,
                venue = %leg.venue,
                symbol = %leg.symbol,
                risk_level = %assessment.risk_level,
                distance_pct = %assessment.distance_pct,
                severity = assessment.severity.as_str(),
                "Leg risk assessed"
            );

            if assessment.severity >= Severity::High {
                warn!(
                    leg_id = %leg.leg_id,
                    venue = %leg.venue,
                    risk_level = %assessment.risk_level,
                    "Leg approaching liquidation"
                );
                store.append_risk_event(
                    session_id,
                    "high_risk",
                    assessment.severity.as_str(),
                    &json!({
                        "leg_id": leg.leg_id,
                        "venue": leg.venue,
                        "symbol": leg.symbol,
                        "risk_level": assessment.risk_level.to_string(),
                        "distance_pct": assessment.distance_pct.to_string(),
                        "mark_price": assessment.mark_price.to_string(),
                        "liquidation_price": assessment.liquidation_price.to_string(),
                    }),
                )?;
            }

            assessments.push(assessment);
        }

        Ok(assessments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::session::LegStatus;
    use chrono::Utc;

    fn leg(side: Side) -> Leg {
        Leg {
            leg_id: "leg-1".into(),
            session_id: "s-1".into(),
            venue: Venue::Bybit,
            symbol: "SOLUSDT".into(),
            side,
            size: dec!(10),
            entry_price: dec!(100),
            mark_price: dec!(100),
            liquidation_price: None,
            margin: dec!(333),
            leverage: dec!(3),
            risk_level: Decimal::ZERO,
            status: LegStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    #[test]
    fn risk_rises_as_mark_approaches_liquidation() {
        let long = leg(Side::Long);
        let far = assess(&long, dec!(100), Some(dec!(60)));
        let near = assess(&long, dec!(100), Some(dec!(95)));
        assert!(near.risk_level > far.risk_level);
        assert_eq!(far.risk_level, dec!(60));
        assert_eq!(near.risk_level, dec!(95));
    }

    #[test]
    fn risk_is_bounded_to_0_100() {
        let long = leg(Side::Long);
        // Liquidation already crossed: distance clamps to zero, risk to 100.
        let crossed = assess(&long, dec!(100), Some(dec!(120)));
        assert_eq!(crossed.distance_pct, Decimal::ZERO);
        assert_eq!(crossed.risk_level, dec!(100));
        assert_eq!(crossed.severity, Severity::Critical);

        // Absurdly distant liquidation still floors at zero risk.
        let distant = assess(&long, dec!(100), Some(dec!(-500)));
        assert_eq!(distant.risk_level, Decimal::ZERO);
    }

    #[test]
    fn short_leg_distance_is_mirrored() {
        let short = leg(Side::Short);
        let a = assess(&short, dec!(100), Some(dec!(140)));
        assert_eq!(a.distance_pct, dec!(40));
        assert_eq!(a.risk_level, dec!(60));

        let crossed = assess(&short, dec!(100), Some(dec!(90)));
        assert_eq!(crossed.risk_level, dec!(100));
    }

    #[test]
    fn missing_liquidation_price_is_synthesized() {
        let long = assess(&leg(Side::Long), dec!(100), None);
        assert_eq!(long.liquidation_price, dec!(70));
        assert_eq!(long.risk_level, dec!(70));

        let short = assess(&leg(Side::Short), dec!(100), None);
        assert_eq!(short.liquidation_price, dec!(130));
        assert_eq!(short.risk_level, dec!(70));
    }

    #[test]
    fn breach_boundary_is_inclusive() {
        let monitor = RiskMonitor::new(dec!(80));
        let long = leg(Side::Long);
        // distance 21% -> risk 79; distance 20% -> risk 80.
        let below = assess(&long, dec!(100), Some(dec!(79)));
        let at = assess(&long, dec!(100), Some(dec!(80)));
        assert_eq!(below.risk_level, dec!(79));
        assert_eq!(at.risk_level, dec!(80));
        assert!(!monitor.is_breach(&below));
        assert!(monitor.is_breach(&at));
    }

    #[test]
    fn severity_buckets() {
        assert_eq!(Severity::from_risk_level(dec!(49.9)), Severity::Low);
        assert_eq!(Severity::from_risk_level(dec!(50)), Severity::Medium);
        assert_eq!(Severity::from_risk_level(dec!(79.9)), Severity::Medium);
        assert_eq!(Severity::from_risk_level(dec!(80)), Severity::High);
        assert_eq!(Severity::from_risk_level(dec!(89.9)), Severity::High);
        assert_eq!(Severity::from_risk_level(dec!(90)), Severity::Critical);
        assert!(Severity::Critical > Severity::High);
    }
}
