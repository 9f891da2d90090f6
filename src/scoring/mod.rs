//! Parameter scoring: extraction waterfall, rubric classification, weighted
//! route totals, and verdict ladders.
//!
//! The scorer is deterministic given identical inputs: the same parameter
//! values, rubric, and route always produce byte-identical scores, verdicts,
//! and classifications.

pub mod rubric;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

use crate::error::Result;
use crate::model::DeliveryMethod;
use crate::provider::{ProviderClient, ProviderQuery};

pub use rubric::{default_rubric, select_range, Parameter, RangeMatch, RubricRange};

/// How a parameter value was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Phase1Summary,
    DedicatedLlm,
    LiveSearch,
    None,
}

impl std::fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Phase1Summary => "phase1_summary",
            Self::DedicatedLlm => "dedicated_llm",
            Self::LiveSearch => "live_search",
            Self::None => "none",
        };
        write!(f, "{}", s)
    }
}

/// Scored outcome for one parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterResult {
    pub parameter: Parameter,
    pub extracted_value: Option<f64>,
    pub unit: String,
    pub score: Option<u8>,
    pub weighted_score: f64,
    pub rationale: String,
    pub range_text: String,
    pub is_exclusion: bool,
    pub extraction_method: ExtractionMethod,
}

/// Weighted totals and classifications for one delivery route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteScores {
    pub delivery_method: DeliveryMethod,
    pub parameters: Vec<ParameterResult>,
    /// Σ weighted scores, capped at 9. Missing scores contribute 0.
    pub total: f64,
    pub verdict: String,
    pub decision_category: String,
    pub priority: String,
    pub risk_level: String,
    pub success_probability: String,
}

/// Full scorer output: the same math run once per route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringOutcome {
    pub transdermal: RouteScores,
    pub transmucosal: RouteScores,
}

impl ScoringOutcome {
    pub fn for_route(&self, route: DeliveryMethod) -> &RouteScores {
        match route {
            DeliveryMethod::Transdermal => &self.transdermal,
            DeliveryMethod::Transmucosal => &self.transmucosal,
        }
    }
}

// Verdict ladders. Shared with the report composer.

pub fn verdict(total: f64) -> &'static str {
    if total >= 7.0 {
        "Go"
    } else if total >= 5.0 {
        "Conditional-Go"
    } else {
        "No-Go"
    }
}

pub fn decision_category(total: f64) -> &'static str {
    if total >= 7.5 {
        "Highly Suitable"
    } else if total >= 6.0 {
        "Suitable"
    } else if total >= 4.5 {
        "Moderate"
    } else {
        "Limited Suitability"
    }
}

pub fn priority(total: f64) -> &'static str {
    if total >= 7.5 {
        "High"
    } else if total >= 5.5 {
        "Medium"
    } else {
        "Low"
    }
}

pub fn risk_level(total: f64) -> &'static str {
    if total >= 7.0 {
        "Low"
    } else if total >= 5.0 {
        "Medium"
    } else {
        "High"
    }
}

pub fn success_probability(total: f64) -> &'static str {
    if total >= 7.5 {
        "High"
    } else if total >= 6.0 {
        "Medium-High"
    } else if total >= 4.5 {
        "Medium"
    } else {
        "Low"
    }
}

/// One extracted value with its provenance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExtractedValue {
    pub value: Option<f64>,
    pub method: ExtractionMethod,
}

/// Classify extracted values against the rubric for one route and compute
/// weighted totals. Pure and deterministic.
pub fn score_route(
    rubric_ranges: &[RubricRange],
    values: &HashMap<Parameter, ExtractedValue>,
    route: DeliveryMethod,
) -> RouteScores {
    let mut parameters = Vec::with_capacity(Parameter::ALL.len());
    let mut total = 0.0;

    for parameter in Parameter::ALL {
        let extracted = values
            .get(&parameter)
            .copied()
            .unwrap_or(ExtractedValue {
                value: None,
                method: ExtractionMethod::None,
            });

        let result = match extracted.value {
            Some(value) => {
                let matched = select_range(rubric_ranges, parameter, route, value);
                let weighted = matched.score as f64 * parameter.weight();
                total += weighted;
                ParameterResult {
                    parameter,
                    extracted_value: Some(value),
                    unit: parameter.unit().to_string(),
                    score: Some(matched.score),
                    weighted_score: weighted,
                    rationale: String::new(),
                    range_text: matched.range_text,
                    is_exclusion: matched.is_exclusion,
                    extraction_method: extracted.method,
                }
            }
            None => ParameterResult {
                parameter,
                extracted_value: None,
                unit: parameter.unit().to_string(),
                score: None,
                weighted_score: 0.0,
                rationale: format!("Parameter value not available for {}.", parameter),
                range_text: "Not Available".to_string(),
                is_exclusion: false,
                extraction_method: ExtractionMethod::None,
            },
        };
        parameters.push(result);
    }

    let total = total.min(9.0);
    RouteScores {
        delivery_method: route,
        parameters,
        total,
        verdict: verdict(total).to_string(),
        decision_category: decision_category(total).to_string(),
        priority: priority(total).to_string(),
        risk_level: risk_level(total).to_string(),
        success_probability: success_probability(total).to_string(),
    }
}

/// The deterministic rationale fallback sentence.
pub fn fallback_rationale(score: u8, parameter: Parameter, value: f64, range_text: &str) -> String {
    format!(
        "Score {} assigned based on {} value of {} in range {}",
        score, parameter, value, range_text
    )
}

/// Parameter scorer with LLM and web-search fallbacks.
pub struct ParameterScorer {
    analysis: Arc<dyn ProviderClient>,
    search: Option<Arc<dyn ProviderClient>>,
    rubric: Vec<RubricRange>,
}

impl ParameterScorer {
    pub fn new(
        analysis: Arc<dyn ProviderClient>,
        search: Option<Arc<dyn ProviderClient>>,
        rubric: Vec<RubricRange>,
    ) -> Self {
        Self {
            analysis,
            search,
            rubric,
        }
    }

    /// Run the full waterfall, score both routes, and generate rationales.
    pub async fn run(&self, drug_name: &str, phase1_context: &str) -> Result<ScoringOutcome> {
        let values = self.extract_parameters(drug_name, phase1_context).await;

        let mut transdermal = score_route(&self.rubric, &values, DeliveryMethod::Transdermal);
        let mut transmucosal = score_route(&self.rubric, &values, DeliveryMethod::Transmucosal);
        self.fill_rationales(drug_name, &mut transdermal).await;
        self.fill_rationales(drug_name, &mut transmucosal).await;

        Ok(ScoringOutcome {
            transdermal,
            transmucosal,
        })
    }

    /// Extraction waterfall: phase1 summary, then per-parameter LLM, then
    /// live search, then none. Stops at the first success per parameter.
    pub async fn extract_parameters(
        &self,
        drug_name: &str,
        phase1_context: &str,
    ) -> HashMap<Parameter, ExtractedValue> {
        let mut values: HashMap<Parameter, ExtractedValue> = HashMap::new();

        if !phase1_context.trim().is_empty() {
            if let Some(parsed) = self.extract_from_phase1(drug_name, phase1_context).await {
                for (parameter, value) in parsed {
                    if let Some(v) = value {
                        values.insert(
                            parameter,
                            ExtractedValue {
                                value: Some(v),
                                method: ExtractionMethod::Phase1Summary,
                            },
                        );
                    }
                }
            }
        }

        for parameter in Parameter::ALL {
            if values.contains_key(&parameter) {
                continue;
            }
            if let Some(v) = self.extract_dedicated(drug_name, parameter).await {
                values.insert(
                    parameter,
                    ExtractedValue {
                        value: Some(v),
                        method: ExtractionMethod::DedicatedLlm,
                    },
                );
                continue;
            }
            if let Some(v) = self.extract_live_search(drug_name, parameter).await {
                values.insert(
                    parameter,
                    ExtractedValue {
                        value: Some(v),
                        method: ExtractionMethod::LiveSearch,
                    },
                );
                continue;
            }
            values.insert(
                parameter,
                ExtractedValue {
                    value: None,
                    method: ExtractionMethod::None,
                },
            );
        }

        values
    }

    async fn extract_from_phase1(
        &self,
        drug_name: &str,
        phase1_context: &str,
    ) -> Option<HashMap<Parameter, Option<f64>>> {
        let prompt = format!(
            "Extract the four scoring parameters for {} from the research summaries below.\n\n\
             1. Dose (mg/kg/day): daily dose, exact value as stated, no unit conversions\n\
             2. Molecular Weight (Da)\n\
             3. Melting Point (°C): for a range, use the highest value\n\
             4. Log P: the partition coefficient\n\n\
             Return ONLY a JSON object:\n\
             {{\"dose\": <number or null>, \"molecular_weight\": <number or null>, \
             \"melting_point\": <number or null>, \"log_p\": <number or null>}}\n\n\
             Summaries:\n{}",
            drug_name, phase1_context
        );
        let query = ProviderQuery::new(prompt)
            .with_temperature(0.0)
            .with_max_tokens(300);

        let response = match self.analysis.query(query).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "phase1 parameter extraction call failed");
                return None;
            }
        };

        let json = parse_json_object(&response.text)?;
        let mut out = HashMap::new();
        for parameter in Parameter::ALL {
            let value = json.get(parameter.key()).and_then(value_as_f64);
            out.insert(parameter, value);
        }
        info!(drug = drug_name, "extracted parameters from phase1 summaries");
        Some(out)
    }

    async fn extract_dedicated(&self, drug_name: &str, parameter: Parameter) -> Option<f64> {
        let instruction = match parameter {
            Parameter::Dose => {
                "Report the typical adult dose in mg/kg/day exactly as documented; do not \
                 convert units or divide by body weight."
            }
            Parameter::MolecularWeight => {
                "Report the exact molecular weight in Daltons (average molecular weight)."
            }
            Parameter::MeltingPoint => {
                "Report the melting point in °C. If a range is given, report the maximum of \
                 the range."
            }
            Parameter::LogP => "Report the experimental LogP (octanol-water) value.",
        };
        let prompt = format!(
            "What is the {} of {}?\n{}\nReturn ONLY the numeric value, or the word null if \
             unknown.",
            parameter, drug_name, instruction
        );
        let query = ProviderQuery::new(prompt)
            .with_temperature(0.0)
            .with_max_tokens(60);

        match self.analysis.query(query).await {
            Ok(response) => parse_first_number(&response.text),
            Err(e) => {
                warn!(parameter = %parameter, error = %e, "dedicated extraction failed");
                None
            }
        }
    }

    async fn extract_live_search(&self, drug_name: &str, parameter: Parameter) -> Option<f64> {
        let search = self.search.as_ref()?;
        let search_query = match parameter {
            Parameter::Dose => format!("What is the standard dose of {} in mg/kg/day?", drug_name),
            Parameter::MolecularWeight => {
                format!("What is the molecular weight of {} in Daltons?", drug_name)
            }
            Parameter::MeltingPoint => {
                format!("What is the melting point of {} in Celsius?", drug_name)
            }
            Parameter::LogP => format!("What is the LogP value of {}?", drug_name),
        };

        let search_result = match search.query(ProviderQuery::new(search_query)).await {
            Ok(r) => r,
            Err(e) => {
                warn!(parameter = %parameter, error = %e, "live search failed");
                return None;
            }
        };
        if search_result.text.trim().is_empty() {
            return None;
        }

        let prompt = format!(
            "From the search results below, extract the {} of {}. Return ONLY the numeric \
             value, or null if not present.\n\n{}",
            parameter, drug_name, search_result.text
        );
        let query = ProviderQuery::new(prompt)
            .with_temperature(0.0)
            .with_max_tokens(60);
        match self.analysis.query(query).await {
            Ok(response) => parse_first_number(&response.text),
            Err(e) => {
                warn!(parameter = %parameter, error = %e, "search extraction failed");
                None
            }
        }
    }

    /// One-sentence rationale per scored parameter, with the deterministic
    /// fallback sentence on LLM failure.
    async fn fill_rationales(&self, drug_name: &str, scores: &mut RouteScores) {
        for result in &mut scores.parameters {
            let (value, score) = match (result.extracted_value, result.score) {
                (Some(v), Some(s)) => (v, s),
                _ => continue,
            };

            let prompt = format!(
                "Generate a concise 1-sentence rationale explaining why {} received a score of \
                 {} for {}.\nParameter: {}\nValue: {}\nRange: {}\nDelivery Method: {}\n\
                 Exactly one sentence, technical, referencing the value and range.",
                drug_name,
                score,
                result.parameter,
                result.parameter,
                value,
                result.range_text,
                scores.delivery_method
            );
            let query = ProviderQuery::new(prompt)
                .with_temperature(0.3)
                .with_max_tokens(100);

            result.rationale = match self.analysis.query(query).await {
                Ok(response) if !response.text.trim().is_empty() => {
                    response.text.trim().to_string()
                }
                _ => fallback_rationale(score, result.parameter, value, &result.range_text),
            };
        }
    }
}

/// Find and parse the first JSON object embedded in a model reply.
pub fn parse_json_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&text[start..=end])
        .ok()?
        .as_object()
        .cloned()
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// First numeric token in free text; `None` when the reply is `null`-ish.
pub fn parse_first_number(text: &str) -> Option<f64> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").unwrap());

    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("null") || trimmed.eq_ignore_ascii_case("unknown") {
        return None;
    }
    pattern.find(trimmed).and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn values(entries: &[(Parameter, Option<f64>, ExtractionMethod)]) -> HashMap<Parameter, ExtractedValue> {
        entries
            .iter()
            .map(|&(p, value, method)| (p, ExtractedValue { value, method }))
            .collect()
    }

    #[test]
    fn test_verdict_ladder() {
        assert_eq!(verdict(7.0), "Go");
        assert_eq!(verdict(6.99), "Conditional-Go");
        assert_eq!(verdict(5.0), "Conditional-Go");
        assert_eq!(verdict(4.99), "No-Go");

        assert_eq!(decision_category(7.5), "Highly Suitable");
        assert_eq!(decision_category(6.0), "Suitable");
        assert_eq!(decision_category(4.5), "Moderate");
        assert_eq!(decision_category(4.49), "Limited Suitability");

        assert_eq!(priority(7.5), "High");
        assert_eq!(priority(5.5), "Medium");
        assert_eq!(priority(5.49), "Low");

        assert_eq!(risk_level(7.0), "Low");
        assert_eq!(risk_level(5.0), "Medium");
        assert_eq!(risk_level(4.99), "High");

        assert_eq!(success_probability(7.5), "High");
        assert_eq!(success_probability(6.0), "Medium-High");
        assert_eq!(success_probability(4.5), "Medium");
        assert_eq!(success_probability(4.0), "Low");
    }

    #[test]
    fn test_score_route_weighted_total() {
        let rubric = default_rubric();
        // Apixaban-like values.
        let extracted = values(&[
            (Parameter::Dose, Some(0.14), ExtractionMethod::Phase1Summary),
            (Parameter::MolecularWeight, Some(459.5), ExtractionMethod::Phase1Summary),
            (Parameter::MeltingPoint, Some(172.0), ExtractionMethod::DedicatedLlm),
            (Parameter::LogP, Some(2.2), ExtractionMethod::Phase1Summary),
        ]);
        let scores = score_route(&rubric, &extracted, DeliveryMethod::Transdermal);

        // 7*0.4 + 7*0.3 + 5*0.2 + 9*0.1 = 2.8 + 2.1 + 1.0 + 0.9 = 6.8
        assert!((scores.total - 6.8).abs() < 1e-9);
        assert_eq!(scores.verdict, "Conditional-Go");
        assert_eq!(scores.decision_category, "Suitable");
        assert_eq!(scores.priority, "Medium");
        assert_eq!(scores.risk_level, "Medium");
    }

    #[test]
    fn test_missing_parameters_contribute_zero() {
        let rubric = default_rubric();
        let extracted = values(&[(
            Parameter::Dose,
            Some(0.05),
            ExtractionMethod::Phase1Summary,
        )]);
        let scores = score_route(&rubric, &extracted, DeliveryMethod::Transdermal);

        // Only dose scored: 9 * 0.4 = 3.6.
        assert!((scores.total - 3.6).abs() < 1e-9);
        assert_eq!(scores.verdict, "No-Go");

        let missing: Vec<_> = scores
            .parameters
            .iter()
            .filter(|p| p.score.is_none())
            .collect();
        assert_eq!(missing.len(), 3);
        for p in missing {
            assert_eq!(p.weighted_score, 0.0);
            assert_eq!(p.range_text, "Not Available");
            assert_eq!(p.extraction_method, ExtractionMethod::None);
        }
    }

    #[test]
    fn test_scorer_determinism() {
        let rubric = default_rubric();
        let extracted = values(&[
            (Parameter::Dose, Some(0.14), ExtractionMethod::Phase1Summary),
            (Parameter::MolecularWeight, Some(459.5), ExtractionMethod::LiveSearch),
            (Parameter::MeltingPoint, Some(172.0), ExtractionMethod::DedicatedLlm),
            (Parameter::LogP, Some(2.2), ExtractionMethod::Phase1Summary),
        ]);
        let a = score_route(&rubric, &extracted, DeliveryMethod::Transmucosal);
        let b = score_route(&rubric, &extracted, DeliveryMethod::Transmucosal);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_total_capped_at_nine() {
        // A rubric where everything scores 9 with inflated weights cannot
        // exceed the cap.
        let rubric = default_rubric();
        let extracted = values(&[
            (Parameter::Dose, Some(0.01), ExtractionMethod::Phase1Summary),
            (Parameter::MolecularWeight, Some(200.0), ExtractionMethod::Phase1Summary),
            (Parameter::MeltingPoint, Some(80.0), ExtractionMethod::Phase1Summary),
            (Parameter::LogP, Some(2.0), ExtractionMethod::Phase1Summary),
        ]);
        let scores = score_route(&rubric, &extracted, DeliveryMethod::Transdermal);
        assert!(scores.total <= 9.0);
        // All nines: 9*(0.4+0.3+0.2+0.1) = 9.0 exactly.
        assert!((scores.total - 9.0).abs() < 1e-9);
        assert_eq!(scores.verdict, "Go");
    }

    #[test]
    fn test_fallback_rationale_format() {
        let sentence = fallback_rationale(7, Parameter::MolecularWeight, 459.5, "350–500 Da");
        assert_eq!(
            sentence,
            "Score 7 assigned based on Molecular Weight value of 459.5 in range 350–500 Da"
        );
    }

    #[test]
    fn test_parse_json_object_with_fences() {
        let text = "Here you go:\n```json\n{\"dose\": 0.14, \"log_p\": null}\n```";
        let obj = parse_json_object(text).unwrap();
        assert_eq!(obj.get("dose").and_then(|v| v.as_f64()), Some(0.14));
        assert!(obj.get("log_p").unwrap().is_null());
    }

    mod waterfall {
        use super::super::*;
        use crate::provider::NormalizedResponse;
        use async_trait::async_trait;
        use chrono::Utc;

        fn response(provider: &str, text: &str) -> NormalizedResponse {
            NormalizedResponse {
                provider: provider.into(),
                model: "mock".into(),
                text: text.into(),
                cited_urls: vec![],
                input_tokens: 10,
                output_tokens: 10,
                latency_ms: 1,
                cost: 0.0,
                timestamp: Utc::now(),
            }
        }

        /// Phase-1 extraction yields dose only; the dedicated query knows the
        /// molecular weight; only live search knows the melting point; log P
        /// is nowhere.
        struct PartialAnalysis;

        #[async_trait]
        impl ProviderClient for PartialAnalysis {
            async fn query(&self, query: ProviderQuery) -> Result<NormalizedResponse> {
                let prompt = &query.prompt;
                if prompt.contains("Extract the four scoring parameters") {
                    return Ok(response(
                        "analysis",
                        r#"{"dose": 0.14, "molecular_weight": null, "melting_point": null, "log_p": null}"#,
                    ));
                }
                if prompt.contains("From the search results below") {
                    if prompt.contains("Melting Point") {
                        return Ok(response("analysis", "172"));
                    }
                    return Ok(response("analysis", "null"));
                }
                if prompt.contains("Molecular Weight") {
                    return Ok(response("analysis", "459.5"));
                }
                Ok(response("analysis", "null"))
            }

            fn name(&self) -> &str {
                "analysis"
            }
        }

        struct SearchMock;

        #[async_trait]
        impl ProviderClient for SearchMock {
            async fn query(&self, _query: ProviderQuery) -> Result<NormalizedResponse> {
                Ok(response("tavily", "The melting point of apixaban is 172 °C."))
            }

            fn name(&self) -> &str {
                "tavily"
            }
        }

        #[tokio::test]
        async fn test_extraction_waterfall_methods() {
            let scorer = ParameterScorer::new(
                Arc::new(PartialAnalysis),
                Some(Arc::new(SearchMock)),
                default_rubric(),
            );
            let values = scorer
                .extract_parameters("Apixaban", "## Dosage\nDose is 0.14 mg/kg/day.")
                .await;

            assert_eq!(
                values[&Parameter::Dose],
                ExtractedValue {
                    value: Some(0.14),
                    method: ExtractionMethod::Phase1Summary,
                }
            );
            assert_eq!(
                values[&Parameter::MolecularWeight],
                ExtractedValue {
                    value: Some(459.5),
                    method: ExtractionMethod::DedicatedLlm,
                }
            );
            assert_eq!(
                values[&Parameter::MeltingPoint],
                ExtractedValue {
                    value: Some(172.0),
                    method: ExtractionMethod::LiveSearch,
                }
            );
            assert_eq!(
                values[&Parameter::LogP],
                ExtractedValue {
                    value: None,
                    method: ExtractionMethod::None,
                }
            );

            // Weighted total uses 0 for the missing parameter; the verdict
            // derives solely from present scores.
            let scores = score_route(&default_rubric(), &values, DeliveryMethod::Transdermal);
            // 7*0.4 + 7*0.3 + 5*0.2 = 5.9
            assert!((scores.total - 5.9).abs() < 1e-9);
            assert_eq!(scores.verdict, "Conditional-Go");
        }
    }

    #[test]
    fn test_parse_first_number() {
        assert_eq!(parse_first_number("459.5 Da"), Some(459.5));
        assert_eq!(parse_first_number("The value is -0.7"), Some(-0.7));
        assert_eq!(parse_first_number("null"), None);
        assert_eq!(parse_first_number("Unknown"), None);
        assert_eq!(parse_first_number("no numbers here"), None);
    }
}
