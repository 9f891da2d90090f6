//! Final report composition.
//!
//! Reads every persisted artifact for a request and assembles the canonical
//! JSON document. LLM-backed sections (executive summary, recommendations)
//! fall back to deterministic rule-based content built from the headline
//! scoring numbers. Once persisted, recomposition returns the stored
//! document unchanged.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::category::{Category, Phase};
use crate::error::Result;
use crate::model::{CategoryStatus, DeliveryMethod, Request, RequestFinalOutput};
use crate::provider::{ProviderClient, ProviderQuery};
use crate::scoring::{
    self, parse_json_object, score_route, ExtractedValue, Parameter, RouteScores, RubricRange,
    ScoringOutcome,
};
use crate::store::Store;

/// Composer for the final output document.
pub struct ReportComposer {
    store: Arc<Store>,
    analysis: Arc<dyn ProviderClient>,
    rubric: Vec<RubricRange>,
}

impl ReportComposer {
    pub fn new(store: Arc<Store>, analysis: Arc<dyn ProviderClient>, rubric: Vec<RubricRange>) -> Self {
        Self {
            store,
            analysis,
            rubric,
        }
    }

    /// Compose (or return the already-persisted) final output.
    pub async fn compose(
        &self,
        request: &Request,
        scoring: Option<&ScoringOutcome>,
    ) -> Result<RequestFinalOutput> {
        if let Some(existing) = self.store.get_final_output(&request.id)? {
            info!(request_id = %request.id, "final output already persisted, reusing");
            return Ok(existing);
        }

        let categories = self.store.load_categories()?;
        let phase1_sections = self.gather_phase1(request, &categories)?;

        let scoring_owned;
        let scoring = match scoring {
            Some(s) => s,
            None => {
                scoring_owned = self.rebuild_scoring(request)?;
                &scoring_owned
            }
        };

        let suitability = suitability_matrix(scoring);
        let coverage = data_coverage_scorecard(&categories, &phase1_sections);

        let executive = self
            .executive_summary(request, &phase1_sections, scoring, &coverage)
            .await;
        let recommendations = self.recommendations(request, scoring, &executive).await;

        let mut structured = Map::new();
        structured.insert(
            "executive_summary_and_decision".to_string(),
            executive.clone(),
        );
        for category in categories.iter().filter(|c| c.phase == Phase::One) {
            if let Some(section) = phase1_sections.get(&category.key) {
                structured.insert(category.key.clone(), Value::Object(section.clone()));
            }
        }
        structured.insert("suitability_matrix".to_string(), suitability);
        structured.insert("data_coverage_scorecard".to_string(), coverage);
        structured.insert("recommendations".to_string(), recommendations);

        let document = json!({
            "request_id": request.id,
            "webhookType": "drug",
            "structured_data": Value::Object(structured),
        });

        let td = &scoring.transdermal;
        let tm = &scoring.transmucosal;
        let output = RequestFinalOutput {
            request_id: request.id.clone(),
            drug_name: request.drug_name.clone(),
            delivery_method: request.delivery_method,
            output: document,
            td_score: td.total,
            tm_score: tm.total,
            td_verdict: td.verdict.clone(),
            tm_verdict: tm.verdict.clone(),
            go_decision: executive
                .get("decision")
                .and_then(|v| v.as_str())
                .unwrap_or("UNKNOWN")
                .to_string(),
            investment_priority: executive
                .get("investment_priority")
                .and_then(|v| v.as_str())
                .unwrap_or("Medium")
                .to_string(),
            risk_level: executive
                .get("risk_level")
                .and_then(|v| v.as_str())
                .unwrap_or("Medium")
                .to_string(),
            version: 1,
            generated_at: Utc::now(),
        };
        self.store.store_final_output(&output)?;
        info!(request_id = %request.id, decision = %output.go_decision, "final output composed");
        Ok(output)
    }

    /// Phase-1 sections keyed by category key: structured data spread first,
    /// then the LLM summary (which wins on key collision).
    fn gather_phase1(
        &self,
        request: &Request,
        categories: &[Category],
    ) -> Result<HashMap<String, Map<String, Value>>> {
        let results = self.store.list_category_results(&request.id)?;
        let mut sections = HashMap::new();

        for category in categories.iter().filter(|c| c.phase == Phase::One) {
            let result = results
                .iter()
                .find(|r| r.category_id == category.id && r.status == CategoryStatus::Completed);
            let result = match result {
                Some(r) => r,
                None => continue,
            };

            let mut section = self
                .store
                .get_merged_data(&result.id)?
                .map(|m| m.structured_data)
                .unwrap_or_default();
            section.insert("summary".to_string(), Value::String(result.summary.clone()));
            sections.insert(category.key.clone(), section);
        }
        Ok(sections)
    }

    /// Rebuild both route scorings from persisted parameter rows; the math
    /// is deterministic so recomposition cannot drift.
    fn rebuild_scoring(&self, request: &Request) -> Result<ScoringOutcome> {
        let rows = self.store.list_parameter_results(&request.id)?;
        let values: HashMap<Parameter, ExtractedValue> = rows
            .iter()
            .map(|r| {
                (
                    r.parameter,
                    ExtractedValue {
                        value: r.extracted_value,
                        method: r.extraction_method,
                    },
                )
            })
            .collect();

        let mut transdermal = score_route(&self.rubric, &values, DeliveryMethod::Transdermal);
        let mut transmucosal = score_route(&self.rubric, &values, DeliveryMethod::Transmucosal);
        // Overlay persisted rationales.
        for row in &rows {
            for route in [&mut transdermal, &mut transmucosal] {
                if let Some(p) = route
                    .parameters
                    .iter_mut()
                    .find(|p| p.parameter == row.parameter)
                {
                    if !row.rationale.is_empty() {
                        p.rationale = row.rationale.clone();
                    }
                }
            }
        }
        Ok(ScoringOutcome {
            transdermal,
            transmucosal,
        })
    }

    async fn executive_summary(
        &self,
        request: &Request,
        phase1: &HashMap<String, Map<String, Value>>,
        scoring: &ScoringOutcome,
        coverage: &Value,
    ) -> Value {
        let td = &scoring.transdermal;
        let tm = &scoring.transmucosal;
        let market = phase1
            .get("market_overview")
            .map(|m| Value::Object(m.clone()))
            .unwrap_or(Value::Null);

        let prompt = format!(
            "Generate an executive summary and GO/NO-GO decision for this drug development \
             opportunity.\n\n\
             Drug: {}\nDelivery Method: {}\n\
             Suitability: transdermal {:.1}/9 ({}), transmucosal {:.1}/9 ({})\n\
             Market overview data: {}\n\
             Data coverage: {}\n\n\
             Return ONLY a JSON object:\n\
             {{\"summary\": \"2-3 sentences\", \"data\": [{{\"decision\": \"GO or NO-GO or \
             CONDITIONAL\", \"justification\": \"...\", \"key_criteria\": \"...\", \
             \"risk_level\": \"Low or Medium or High\"}}], \"key_summary_points\": {{\"decision\": \
             \"...\", \"market_size\": \"...\", \"growth_rate\": \"...\", \"patent_timing\": \
             \"...\", \"formulation_focus\": \"...\", \"geographic_strategy\": \"...\", \
             \"investment_level\": \"...\", \"risk_assessment\": \"...\"}}, \"decision\": \"GO or \
             NO-GO or CONDITIONAL\", \"investment_priority\": \"Low or Medium or High\", \
             \"risk_level\": \"Low or Medium or High\"}}",
            request.drug_name,
            request.delivery_method,
            td.total,
            td.verdict,
            tm.total,
            tm.verdict,
            market,
            coverage.get("summary").and_then(|v| v.as_str()).unwrap_or(""),
        );
        let query = ProviderQuery::new(prompt)
            .with_temperature(0.3)
            .with_max_tokens(1000);

        match self.analysis.query(query).await {
            Ok(response) => match parse_json_object(&response.text) {
                Some(parsed) if parsed.contains_key("decision") => Value::Object(parsed),
                _ => {
                    warn!("executive summary reply unparseable, using fallback");
                    fallback_executive_summary(request, scoring)
                }
            },
            Err(e) => {
                warn!(error = %e, "executive summary LLM failed, using fallback");
                fallback_executive_summary(request, scoring)
            }
        }
    }

    async fn recommendations(
        &self,
        request: &Request,
        scoring: &ScoringOutcome,
        executive: &Value,
    ) -> Value {
        let decision = executive
            .get("decision")
            .and_then(|v| v.as_str())
            .unwrap_or("UNKNOWN");
        let prompt = format!(
            "Generate 3-5 strategic recommendations for this drug development opportunity.\n\n\
             Drug: {}\nDecision: {}\nTransdermal score: {:.1}/9\nTransmucosal score: {:.1}/9\n\n\
             Cover formulation development, market expansion, risk mitigation, patent and \
             regulatory strategy, and investment priorities.\n\n\
             Return ONLY a JSON object:\n\
             {{\"summary\": \"1-2 sentence overview\", \"data\": [{{\"recommendation\": \"...\", \
             \"rationale\": \"...\", \"timeline\": \"...\", \"owner\": \"...\"}}]}}",
            request.drug_name, decision, scoring.transdermal.total, scoring.transmucosal.total,
        );
        let query = ProviderQuery::new(prompt)
            .with_temperature(0.4)
            .with_max_tokens(1200);

        match self.analysis.query(query).await {
            Ok(response) => match parse_json_object(&response.text) {
                Some(parsed) if parsed.contains_key("data") => Value::Object(parsed),
                _ => fallback_recommendations(request, scoring),
            },
            Err(e) => {
                warn!(error = %e, "recommendations LLM failed, using fallback");
                fallback_recommendations(request, scoring)
            }
        }
    }
}

/// The suitability matrix section, built from both route scorings.
pub fn suitability_matrix(scoring: &ScoringOutcome) -> Value {
    let td = &scoring.transdermal;
    let tm = &scoring.transmucosal;

    let parameter_rows: Vec<Value> = td
        .parameters
        .iter()
        .zip(tm.parameters.iter())
        .map(|(td_p, tm_p)| {
            let value = match td_p.extracted_value {
                Some(v) if td_p.unit.is_empty() => v.to_string(),
                Some(v) => format!("{} {}", v, td_p.unit),
                None => "Not available".to_string(),
            };
            json!({
                "parameter": td_p.parameter.display_name(),
                "value": value,
                "td_score": td_p.score,
                "td_rationale": td_p.rationale,
                "tm_score": tm_p.score,
                "tm_rationale": tm_p.rationale,
            })
        })
        .collect();

    json!({
        "summary": format!(
            "The quantitative analysis shows that both transdermal and transmucosal routes \
             have been evaluated. Transmucosal delivery scores {:.1}/9 while transdermal \
             scores {:.1}/9.",
            tm.total, td.total
        ),
        "corrected_parameter_based_scoring": parameter_rows,
        "weighted_scoring_assessment": {
            "td_weighted_score": weighted_score_map(td, "total_td_score"),
            "tm_weighted_score": weighted_score_map(tm, "total_tm_score"),
        },
        "delivery_route_feasibility_assessment": [
            route_assessment("Transdermal (TD)", td),
            route_assessment("Transmucosal (TM)", tm),
        ],
        "final_weighted_scores": {
            "transdermal_td": format!("{:.1} ({:.2}%)", td.total, td.total / 9.0 * 100.0),
            "transmucosal_tm": format!("{:.1} ({:.2}%)", tm.total, tm.total / 9.0 * 100.0),
        },
        "strategic_decision_matrix": {
            "go_no_go_verdicts": {
                "transdermal_route": format!("{} - {}", td.verdict, verdict_rationale(td)),
                "transmucosal_route": format!("{} - {}", tm.verdict, verdict_rationale(tm)),
            },
            "risk_assessment": {
                "high_risk_factors": {
                    "td": risk_factors(td),
                    "tm": risk_factors(tm),
                },
                "mitigation_opportunities": {
                    "td": "Advanced penetration enhancers and formulation technologies.",
                    "tm": "Permeation enhancers and novel delivery systems.",
                },
                "success_probability": {
                    "td_route": format!("{} - {} risk", td.success_probability, td.risk_level),
                    "tm_route": format!("{} - {} risk", tm.success_probability, tm.risk_level),
                },
            },
        },
    })
}

fn weighted_score_map(route: &RouteScores, total_key: &str) -> Value {
    let mut map = Map::new();
    for p in &route.parameters {
        map.insert(
            p.parameter.key().to_string(),
            Value::String(format!(
                "{} × {:.2} = {:.1}",
                p.score.map(|s| s.to_string()).unwrap_or_else(|| "0".into()),
                p.parameter.weight(),
                p.weighted_score
            )),
        );
    }
    map.insert(
        total_key.to_string(),
        Value::String(format!("{:.1}", route.total)),
    );
    Value::Object(map)
}

fn route_assessment(label: &str, route: &RouteScores) -> Value {
    json!({
        "route": label,
        "total_score": format!("{:.1}", route.total),
        "max_possible": "9",
        "percentage": format!("{:.2}%", route.total / 9.0 * 100.0),
        "decision_category": route.decision_category,
        "verdict": route.verdict,
        "development_priority": route.priority,
    })
}

fn verdict_rationale(route: &RouteScores) -> String {
    if route.total >= 7.0 {
        "Favorable physicochemical properties support development".to_string()
    } else if route.total >= 5.0 {
        "Moderate suitability with formulation enhancement required".to_string()
    } else {
        let limiting: Vec<&str> = route
            .parameters
            .iter()
            .filter(|p| p.score.map(|s| s < 5).unwrap_or(false))
            .map(|p| p.parameter.display_name())
            .take(2)
            .collect();
        if limiting.is_empty() {
            "Physicochemical limitations present development challenges".to_string()
        } else {
            format!("Limited by {} constraints", limiting.join(", "))
        }
    }
}

fn risk_factors(route: &RouteScores) -> String {
    let low_scoring: Vec<&str> = route
        .parameters
        .iter()
        .filter(|p| p.score.map(|s| s < 5).unwrap_or(false))
        .map(|p| p.parameter.display_name())
        .collect();
    if low_scoring.is_empty() {
        "No significant high-risk factors identified".to_string()
    } else {
        format!(
            "Challenges with {} require mitigation strategies",
            low_scoring.join(", ")
        )
    }
}

/// Per-category completion: 40 points for a substantive summary (20 for any
/// summary), plus 60 for ≥3 structured keys (30 for ≥1). Missing categories
/// score 0.
pub fn category_completion(section: &Map<String, Value>) -> u32 {
    let mut score = 0;
    let summary_len = section
        .get("summary")
        .and_then(|v| v.as_str())
        .map(|s| s.chars().count())
        .unwrap_or(0);
    if summary_len > 100 {
        score += 40;
    } else if summary_len > 0 {
        score += 20;
    }

    let structured_keys = section.keys().filter(|k| k.as_str() != "summary").count();
    if structured_keys >= 3 {
        score += 60;
    } else if structured_keys >= 1 {
        score += 30;
    }
    score.min(100)
}

/// The data-coverage scorecard section.
pub fn data_coverage_scorecard(
    categories: &[Category],
    sections: &HashMap<String, Map<String, Value>>,
) -> Value {
    let phase1: Vec<&Category> = categories.iter().filter(|c| c.phase == Phase::One).collect();
    let mut rows = Vec::new();
    let mut total_completion = 0u32;

    for category in &phase1 {
        let (completion, notes) = match sections.get(&category.key) {
            Some(section) => {
                let completion = category_completion(section);
                (completion, coverage_notes(completion))
            }
            None => (0, "Data not available - category not processed".to_string()),
        };
        total_completion += completion;
        rows.push(json!({
            "category": category.name,
            "completion_percent": format!("{}%", completion),
            "data_source": data_source_for(&category.key),
            "notes": notes,
        }));
    }

    let average = if phase1.is_empty() {
        0.0
    } else {
        total_completion as f64 / phase1.len() as f64
    };
    let classification = if average >= 85.0 {
        "comprehensive"
    } else if average >= 70.0 {
        "good"
    } else if average >= 50.0 {
        "partial"
    } else {
        "limited"
    };

    json!({
        "summary": format!(
            "The data coverage is {} across the analyzed categories, with an average \
             completion of {:.0}%.",
            classification, average
        ),
        "data": rows,
    })
}

fn coverage_notes(completion: u32) -> String {
    if completion >= 90 {
        "Comprehensive data with detailed insights.".to_string()
    } else if completion >= 70 {
        "Good coverage with most key data points available.".to_string()
    } else if completion >= 50 {
        "Partial coverage - additional data could enhance analysis.".to_string()
    } else {
        "Limited data available - consider additional research.".to_string()
    }
}

fn data_source_for(key: &str) -> &'static str {
    match key {
        "market_overview" => "Market Analysis Reports",
        "competitive_landscape" => "Market Intelligence, Company Reports",
        "regulatory_and_patent_status" => "FDA, EMA, USPTO, EPO",
        "commercial_opportunities" => "Market Analysis Reports",
        "current_formulations" => "FDA, Manufacturer Reports",
        "investigational_formulations" => "Company Reports, ClinicalTrials.gov",
        "physicochemical_profile" => "PubChem, Literature",
        "pharmacokinetics" => "FDA Label, PubMed",
        "dosage_forms" => "FDA Label, Manufacturer Reports",
        "clinical_trials_and_safety" => "ClinicalTrials.gov, PubMed",
        _ => "Multiple Sources",
    }
}

/// Rule-based executive summary used when the LLM section fails.
pub fn fallback_executive_summary(request: &Request, scoring: &ScoringOutcome) -> Value {
    let best = scoring.transdermal.total.max(scoring.transmucosal.total);
    let (decision, priority, risk) = if best >= 7.0 {
        ("GO", "High", "Medium")
    } else if best >= 5.0 {
        ("CONDITIONAL", "Medium", "Medium")
    } else {
        ("NO-GO", "Low", "High")
    };
    let category = scoring::decision_category(best);

    json!({
        "summary": format!(
            "{} shows {} potential for {} delivery with a suitability score of {:.1}/9. {} \
             decision recommended based on technical feasibility and market analysis.",
            request.drug_name,
            category.to_lowercase(),
            request.delivery_method,
            best,
            decision
        ),
        "data": [{
            "decision": decision,
            "justification": format!(
                "Suitability score of {:.1}/9 indicates {} potential",
                best,
                category.to_lowercase()
            ),
            "key_criteria": "Suitability score, market size, technical feasibility",
            "risk_level": risk,
        }],
        "key_summary_points": {
            "decision": format!("{} - {}", decision, category),
            "market_size": "See market overview analysis",
            "growth_rate": "See market overview analysis",
            "patent_timing": "See detailed patent analysis",
            "formulation_focus": request.delivery_method.to_string(),
            "geographic_strategy": "Global opportunity",
            "investment_level": format!("{} priority", priority),
            "risk_assessment": format!("{} risk level", risk),
        },
        "decision": decision,
        "investment_priority": priority,
        "risk_level": risk,
    })
}

/// Rule-based recommendations used when the LLM section fails.
pub fn fallback_recommendations(request: &Request, scoring: &ScoringOutcome) -> Value {
    let best = scoring.transdermal.total.max(scoring.transmucosal.total);
    let route = if scoring.transdermal.total >= scoring.transmucosal.total {
        "transdermal"
    } else {
        "transmucosal"
    };
    json!({
        "summary": format!(
            "Prioritize {} formulation development for {} and close remaining data gaps.",
            route, request.drug_name
        ),
        "data": [
            {
                "recommendation": format!("Advance {} formulation feasibility studies", route),
                "rationale": format!("Best route scores {:.1}/9 on the parameter rubric", best),
                "timeline": "6-12 months",
                "owner": "R&D",
            },
            {
                "recommendation": "Close data gaps identified in the coverage scorecard",
                "rationale": "Categories below full completion weaken decision confidence",
                "timeline": "3-6 months",
                "owner": "Commercial",
            },
            {
                "recommendation": "Reassess verdict after formulation prototyping",
                "rationale": "Scores near decision boundaries can shift with new data",
                "timeline": "12-18 months",
                "owner": "Clinical Development",
            },
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeliveryMethod;
    use crate::scoring::{score_route, ExtractionMethod};
    use pretty_assertions::assert_eq;

    fn scoring_outcome(values: &[(Parameter, Option<f64>)]) -> ScoringOutcome {
        let rubric = crate::scoring::default_rubric();
        let values: HashMap<Parameter, ExtractedValue> = values
            .iter()
            .map(|&(p, v)| {
                (
                    p,
                    ExtractedValue {
                        value: v,
                        method: ExtractionMethod::Phase1Summary,
                    },
                )
            })
            .collect();
        ScoringOutcome {
            transdermal: score_route(&rubric, &values, DeliveryMethod::Transdermal),
            transmucosal: score_route(&rubric, &values, DeliveryMethod::Transmucosal),
        }
    }

    fn apixaban_outcome() -> ScoringOutcome {
        scoring_outcome(&[
            (Parameter::Dose, Some(0.14)),
            (Parameter::MolecularWeight, Some(459.5)),
            (Parameter::MeltingPoint, Some(172.0)),
            (Parameter::LogP, Some(2.2)),
        ])
    }

    #[test]
    fn test_suitability_matrix_shape() {
        let matrix = suitability_matrix(&apixaban_outcome());

        let rows = matrix["corrected_parameter_based_scoring"].as_array().unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0]["parameter"], "Dose");
        assert_eq!(rows[0]["value"], "0.14 mg/kg/day");

        // final_weighted_scores carries "score (percentage)" strings.
        let td_final = matrix["final_weighted_scores"]["transdermal_td"]
            .as_str()
            .unwrap();
        assert!(td_final.contains("6.8"));
        assert!(td_final.contains('%'));

        let feasibility = matrix["delivery_route_feasibility_assessment"]
            .as_array()
            .unwrap();
        assert_eq!(feasibility.len(), 2);
        assert_eq!(feasibility[0]["route"], "Transdermal (TD)");
        assert_eq!(feasibility[0]["verdict"], "Conditional-Go");

        let totals = &matrix["weighted_scoring_assessment"]["td_weighted_score"];
        assert_eq!(totals["total_td_score"], "6.8");
        assert_eq!(totals["dose"], "7 × 0.40 = 2.8");
    }

    #[test]
    fn test_category_completion_boundaries() {
        // Long summary + 3 structured keys = 100.
        let mut full = Map::new();
        full.insert("summary".into(), Value::String("x".repeat(101)));
        full.insert("a".into(), json!(1));
        full.insert("b".into(), json!(2));
        full.insert("c".into(), json!(3));
        assert_eq!(category_completion(&full), 100);

        // Nothing = 0.
        assert_eq!(category_completion(&Map::new()), 0);

        // Short summary only = 20.
        let mut short = Map::new();
        short.insert("summary".into(), Value::String("brief".into()));
        assert_eq!(category_completion(&short), 20);

        // Exactly 100 chars is not "long".
        let mut boundary = Map::new();
        boundary.insert("summary".into(), Value::String("x".repeat(100)));
        assert_eq!(category_completion(&boundary), 20);

        // One structured key only = 30.
        let mut one_key = Map::new();
        one_key.insert("a".into(), json!(1));
        assert_eq!(category_completion(&one_key), 30);
    }

    #[test]
    fn test_scorecard_classification() {
        let categories = crate::category::default_categories();
        let mut sections = HashMap::new();
        for category in categories.iter().filter(|c| c.phase == Phase::One) {
            let mut section = Map::new();
            section.insert("summary".into(), Value::String("x".repeat(200)));
            section.insert("a".into(), json!(1));
            section.insert("b".into(), json!(2));
            section.insert("c".into(), json!(3));
            sections.insert(category.key.clone(), section);
        }

        let scorecard = data_coverage_scorecard(&categories, &sections);
        assert!(scorecard["summary"]
            .as_str()
            .unwrap()
            .contains("comprehensive"));
        assert_eq!(scorecard["data"].as_array().unwrap().len(), 10);

        // Missing categories score zero and pull the average down.
        let scorecard = data_coverage_scorecard(&categories, &HashMap::new());
        assert!(scorecard["summary"].as_str().unwrap().contains("limited"));
        let rows = scorecard["data"].as_array().unwrap();
        assert!(rows.iter().all(|r| r["completion_percent"] == "0%"));
    }

    #[test]
    fn test_fallback_executive_summary_thresholds() {
        let request = Request::new("Apixaban", DeliveryMethod::Transdermal);

        let high = scoring_outcome(&[
            (Parameter::Dose, Some(0.05)),
            (Parameter::MolecularWeight, Some(300.0)),
            (Parameter::MeltingPoint, Some(90.0)),
            (Parameter::LogP, Some(2.0)),
        ]);
        let summary = fallback_executive_summary(&request, &high);
        assert_eq!(summary["decision"], "GO");
        assert_eq!(summary["investment_priority"], "High");

        let mid = apixaban_outcome();
        let summary = fallback_executive_summary(&request, &mid);
        assert_eq!(summary["decision"], "CONDITIONAL");

        let low = scoring_outcome(&[(Parameter::Dose, Some(5.0))]);
        let summary = fallback_executive_summary(&request, &low);
        assert_eq!(summary["decision"], "NO-GO");
        assert_eq!(summary["risk_level"], "High");
    }

    #[test]
    fn test_fallback_recommendations_prefer_better_route() {
        let request = Request::new("Apixaban", DeliveryMethod::Transdermal);
        let outcome = apixaban_outcome();
        let recs = fallback_recommendations(&request, &outcome);
        let data = recs["data"].as_array().unwrap();
        assert!(data.len() >= 3);
        // Transmucosal scores higher for apixaban-like values.
        assert!(recs["summary"].as_str().unwrap().contains("transmucosal"));
    }

    #[test]
    fn test_verdict_rationale_names_limiting_parameters() {
        let outcome = scoring_outcome(&[
            (Parameter::Dose, Some(1.2)),
            (Parameter::MolecularWeight, Some(900.0)),
        ]);
        let rationale = verdict_rationale(&outcome.transdermal);
        assert!(rationale.contains("Limited by"));
        assert!(rationale.contains("Dose"));
    }
}
