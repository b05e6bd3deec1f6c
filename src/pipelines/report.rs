//! Deterministic risk report pipeline.
//!
//! ```text
//! profile ─▶ score ─┬─▶ section.overview ─┐
//!   (checkpoint     ├─▶ section.signals  ─┼─▶ assemble ─▶ review ─▶ publish
//!    "scored")      └─▶ section.outlook  ─┘   (repair)   (validator)
//! ```
//!
//! Input keys: `company` (`{name, sector}`), `metrics` (`{revenue_growth,
//! debt_ratio, margin, volatility}`), and optionally `additional_data`
//! (free-form notes used by the outlook section) and `fail_sections` (ids of
//! sections that should fail, for exercising degraded joins).
//!
//! The review validator requires recommendations on any report rated
//! `moderate` or worse. `assemble` only writes them when review feedback asks
//! for them, so risky inputs go through one repair round.

use crate::errors::{Result, StageError};
use crate::graph::{
    Assessment, GraphBuilder, GroupPolicy, PipelineGraph, Stage, StageDescriptor, StageInput,
    Validator, stage_fn,
};
use crate::repair::RepairPolicy;
use crate::state::{PartialState, State, partial};
use async_trait::async_trait;
use cascade_common::Issue;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const GRAPH_ID: &str = "report";

/// Parallel group holding the report sections.
pub const SECTIONS_GROUP: &str = "sections";

/// Section stages in report order.
pub const SECTION_STAGES: [&str; 3] = ["section.overview", "section.signals", "section.outlook"];

/// Risk score from which a report must carry recommendations.
pub const RECOMMENDATION_THRESHOLD: f64 = 0.3;

/// Knobs taken from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportSettings {
    pub retry_budget: u32,
    pub threshold: f64,
    pub sections_policy: GroupPolicy,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            retry_budget: crate::repair::DEFAULT_RETRY_BUDGET,
            threshold: crate::repair::DEFAULT_THRESHOLD,
            sections_policy: GroupPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Company {
    pub name: String,
    #[serde(default)]
    pub sector: Option<String>,
}

/// Financial indicators, each a ratio.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default)]
    pub revenue_growth: f64,
    #[serde(default)]
    pub debt_ratio: f64,
    #[serde(default)]
    pub margin: f64,
    #[serde(default)]
    pub volatility: f64,
}

impl Metrics {
    /// Weighted risk in `[0, 1]`, rounded to two decimals.
    pub fn risk_score(&self) -> f64 {
        let debt = self.debt_ratio.clamp(0.0, 1.0);
        let volatility = self.volatility.clamp(0.0, 1.0);
        let decline = (-self.revenue_growth).clamp(0.0, 1.0);
        let thin_margin = (0.2 - self.margin).clamp(0.0, 0.2) / 0.2;
        let score = 0.35 * debt + 0.25 * volatility + 0.25 * decline + 0.15 * thin_margin;
        (score * 100.0).round() / 100.0
    }

    pub fn risk_factors(&self) -> Vec<&'static str> {
        let mut factors = Vec::new();
        if self.debt_ratio > 0.6 {
            factors.push("high leverage");
        }
        if self.volatility > 0.5 {
            factors.push("volatile earnings");
        }
        if self.revenue_growth < 0.0 {
            factors.push("declining revenue");
        }
        if self.margin < 0.05 {
            factors.push("thin margins");
        }
        factors
    }
}

pub fn rating(risk_score: f64) -> &'static str {
    if risk_score < RECOMMENDATION_THRESHOLD {
        "low"
    } else if risk_score < 0.5 {
        "moderate"
    } else {
        "high"
    }
}

/// Build the report graph.
pub fn build(settings: &ReportSettings) -> Result<PipelineGraph> {
    let mut builder = GraphBuilder::new(GRAPH_ID)
        .accumulating("sections")
        .stage(
            StageDescriptor::new("profile")
                .reads(["company"])
                .writes(["profile"]),
            stage_fn(profile),
        )
        .stage(
            StageDescriptor::new("score")
                .reads(["profile", "metrics"])
                .writes(["risk_score", "risk_factors"])
                .checkpoint("scored"),
            stage_fn(score),
        );

    for id in SECTION_STAGES {
        builder = builder.stage(
            StageDescriptor::new(id)
                .in_group(SECTIONS_GROUP)
                .reads(["profile", "risk_score", "risk_factors"])
                .writes(["sections"]),
            SectionStage { id },
        );
    }

    builder
        .group_policy(SECTIONS_GROUP, settings.sections_policy)
        .stage(
            StageDescriptor::new("assemble")
                .reads(["profile", "risk_score", "sections"])
                .writes(["report"]),
            AssembleStage,
        )
        .validator(StageDescriptor::new("review").reads(["report"]), ReviewValidator)
        .stage(
            StageDescriptor::new("publish")
                .reads(["report"])
                .writes(["published"])
                .after(["review"]),
            stage_fn(publish),
        )
        .repair(
            RepairPolicy::new("assemble")
                .with_threshold(settings.threshold)
                .with_retry_budget(settings.retry_budget),
        )
        .build()
}

async fn profile(input: StageInput) -> std::result::Result<PartialState, StageError> {
    let company: Company = input.state.get_as("company")?;
    if company.name.trim().is_empty() {
        return Err(StageError::failed("company name is empty"));
    }
    let sector = company.sector.unwrap_or_else(|| "unclassified".to_string());
    Ok(partial([(
        "profile",
        json!({
            "name": company.name.trim(),
            "sector": sector,
        }),
    )]))
}

async fn score(input: StageInput) -> std::result::Result<PartialState, StageError> {
    let metrics: Metrics = input.state.get_as("metrics")?;
    Ok(partial([
        ("risk_score", json!(metrics.risk_score())),
        ("risk_factors", json!(metrics.risk_factors())),
    ]))
}

async fn publish(input: StageInput) -> std::result::Result<PartialState, StageError> {
    let report = input.state.require("report")?;
    let sections = report["sections"].as_array().map_or(0, Vec::len);
    Ok(partial([(
        "published",
        json!({
            "title": report["title"],
            "rating": report["rating"],
            "sections": sections,
            "degraded": report["degraded"].as_array().is_some_and(|d| !d.is_empty()),
            "attempt": report["attempt"],
        }),
    )]))
}

/// One report section; all three share the same inputs.
struct SectionStage {
    id: &'static str,
}

#[async_trait]
impl Stage for SectionStage {
    async fn run(&self, input: StageInput) -> std::result::Result<PartialState, StageError> {
        let failing = input
            .state
            .get("fail_sections")
            .and_then(Value::as_array)
            .is_some_and(|ids| ids.iter().any(|v| v.as_str() == Some(self.id)));
        if failing {
            return Err(StageError::failed(format!("{} was asked to fail", self.id)));
        }

        let name = input.state.require("profile")?["name"]
            .as_str()
            .unwrap_or("company")
            .to_string();
        let risk: f64 = input.state.get_as("risk_score")?;
        let factors: Vec<String> = input.state.get_as("risk_factors")?;

        let (title, body) = match self.id {
            "section.overview" => (
                "Overview",
                format!("{} carries a {} risk profile (score {:.2}).", name, rating(risk), risk),
            ),
            "section.signals" => (
                "Signals",
                if factors.is_empty() {
                    "No material risk signals detected.".to_string()
                } else {
                    format!("Risk signals: {}.", factors.join(", "))
                },
            ),
            _ => {
                let notes = input
                    .state
                    .get("additional_data")
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .map(|notes| format!(" Analyst notes: {}", notes))
                    .unwrap_or_default();
                let outlook = if risk < RECOMMENDATION_THRESHOLD {
                    "stable"
                } else if risk < 0.5 {
                    "watch"
                } else {
                    "negative"
                };
                ("Outlook", format!("Outlook is {}.{}", outlook, notes))
            }
        };

        Ok(partial([(
            "sections",
            json!({ "id": self.id, "title": title, "body": body }),
        )]))
    }
}

/// Join stage and repair target: assembles sections into the report.
struct AssembleStage;

#[async_trait]
impl Stage for AssembleStage {
    async fn run(&self, input: StageInput) -> std::result::Result<PartialState, StageError> {
        let profile = input.state.require("profile")?;
        let risk: f64 = input.state.get_as("risk_score")?;

        // Branch arrival order varies; sections are laid out in report order.
        let mut sections: Vec<Value> = input
            .state
            .branch_values("sections")
            .into_iter()
            .map(|(_, value)| value.clone())
            .collect();
        sections.sort_by_key(|s| {
            SECTION_STAGES
                .iter()
                .position(|id| s["id"].as_str() == Some(*id))
                .unwrap_or(SECTION_STAGES.len())
        });

        let degraded: Vec<String> = input
            .join(SECTIONS_GROUP)
            .map(|j| j.failed_ids().into_iter().map(str::to_string).collect())
            .unwrap_or_default();

        let mut report = json!({
            "title": format!("Risk report: {}", profile["name"].as_str().unwrap_or("unknown")),
            "sector": profile["sector"],
            "risk_score": risk,
            "rating": rating(risk),
            "sections": sections,
            "degraded": degraded,
            "attempt": input.attempt,
        });

        let previous = input
            .previous_output
            .as_ref()
            .and_then(|p| p.get("report"))
            .and_then(|r| r["recommendations"].as_array())
            .cloned();
        if let Some(recommendations) = previous {
            report["recommendations"] = json!(recommendations);
        } else if input.feedback_for("report.recommendations").is_some() {
            let added = recommendations(risk, &input.state)?;
            report["recommendations"] = json!(added);
        }

        Ok(partial([("report", report)]))
    }
}

fn recommendations(risk: f64, state: &State) -> std::result::Result<Vec<String>, StageError> {
    let factors: Vec<String> = state.get_as("risk_factors")?;
    let mut out: Vec<String> = factors
        .iter()
        .map(|factor| match factor.as_str() {
            "high leverage" => "Reduce leverage or extend debt maturities.".to_string(),
            "volatile earnings" => "Hedge earnings exposure to key drivers.".to_string(),
            "declining revenue" => "Review revenue concentration and pipeline.".to_string(),
            "thin margins" => "Audit cost base for margin recovery.".to_string(),
            other => format!("Monitor {}.", other),
        })
        .collect();
    if out.is_empty() || risk >= 0.5 {
        out.push("Escalate to credit committee for quarterly review.".to_string());
    }
    Ok(out)
}

/// Scores report completeness.
struct ReviewValidator;

#[async_trait]
impl Validator for ReviewValidator {
    async fn validate(&self, state: State) -> std::result::Result<Assessment, StageError> {
        let Some(report) = state.get("report") else {
            return Ok(Assessment::new(0.0, vec![Issue::blocking("report", "report is missing")]));
        };

        let mut score: f64 = 1.0;
        let mut issues = Vec::new();

        let present: Vec<&str> = report["sections"]
            .as_array()
            .map(|s| s.iter().filter_map(|v| v["id"].as_str()).collect())
            .unwrap_or_default();
        for id in SECTION_STAGES {
            if !present.contains(&id) {
                score -= 0.1;
                issues.push(Issue::advisory("report.sections", format!("section '{}' is missing", id)));
            }
        }

        let risk = report["risk_score"].as_f64().unwrap_or(1.0);
        let has_recommendations = report["recommendations"]
            .as_array()
            .is_some_and(|r| !r.is_empty());
        if risk >= RECOMMENDATION_THRESHOLD && !has_recommendations {
            score -= 0.5;
            issues.push(Issue::blocking(
                "report.recommendations",
                format!("{} risk report needs recommendations", rating(risk)),
            ));
        }

        Ok(Assessment::new(score, issues))
    }
}
