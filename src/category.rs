//! Pharmaceutical category reference data.
//!
//! Categories, their prompt templates, verification criteria, and dependency
//! edges are data. Code never hard-codes category names or display orders;
//! everything is driven from this table (persisted to the reference tables at
//! startup and reloadable from there).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::validation::ValidationRule;

/// Processing phase for a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    One,
    Two,
}

impl Phase {
    pub fn as_i64(&self) -> i64 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }

    pub fn from_i64(v: i64) -> Result<Self> {
        match v {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            other => Err(Error::Config(format!("invalid phase: {}", other))),
        }
    }
}

/// How conflicting source claims are resolved during merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Higher authority wins; length then provider id break ties.
    AuthorityWeighted,
    /// Keep the most recent claim when sources are dated.
    MostRecent,
}

/// One pharmaceutical analysis category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    /// Stable snake_case key used in the final report JSON.
    pub key: String,
    pub phase: Phase,
    pub display_order: i64,
    pub is_active: bool,
    /// Prompt template with a `{drug_name}` placeholder.
    pub prompt_template: String,
    pub verification_rules: Vec<ValidationRule>,
    pub conflict_strategy: ConflictStrategy,
    /// Structured-data keys the merge extraction should populate.
    pub expected_keys: Vec<String>,
}

impl Category {
    pub fn render_prompt(&self, drug_name: &str) -> String {
        self.prompt_template.replace("{drug_name}", drug_name)
    }
}

/// Directed dependency edge: `dependent` requires `required`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CategoryDependency {
    pub dependent_id: i64,
    pub required_id: i64,
}

fn category(
    id: i64,
    name: &str,
    key: &str,
    phase: Phase,
    display_order: i64,
    prompt_template: &str,
    verification_rules: Vec<ValidationRule>,
    expected_keys: &[&str],
) -> Category {
    Category {
        id,
        name: name.to_string(),
        key: key.to_string(),
        phase,
        display_order,
        is_active: true,
        prompt_template: prompt_template.to_string(),
        verification_rules,
        conflict_strategy: ConflictStrategy::AuthorityWeighted,
        expected_keys: expected_keys.iter().map(|s| s.to_string()).collect(),
    }
}

/// The seeded category set.
pub fn default_categories() -> Vec<Category> {
    vec![
        category(
            1,
            "Market Overview",
            "market_overview",
            Phase::One,
            1,
            "Analyze the global and regional market for {drug_name}. Include: current global \
             market size in USD, year-over-year growth rates, regional distribution (US, EU, \
             Asia, others), market penetration, pricing trends, and reimbursement status by \
             country. Focus on the last 3 years and prioritize government sources and industry \
             reports.",
            vec![
                ValidationRule::RequiredSection { keyword: "market".into() },
                ValidationRule::MinNumericValues { count: 3 },
                ValidationRule::MinSectionCount { count: 2 },
            ],
            &["current", "forecast", "regional_distribution"],
        ),
        category(
            2,
            "Competitive Landscape",
            "competitive_landscape",
            Phase::One,
            2,
            "Provide a competitive analysis for {drug_name}. Include: direct competitors with \
             market share, indirect and alternative therapies, competitive advantages and \
             disadvantages, head-to-head trial comparisons, pricing comparison, and pipeline \
             competitors in development.",
            vec![
                ValidationRule::RequiredSection { keyword: "competitor".into() },
                ValidationRule::MinSectionCount { count: 2 },
            ],
            &["direct_competitors", "pipeline_competitors"],
        ),
        category(
            3,
            "Regulatory & Patent Status",
            "regulatory_and_patent_status",
            Phase::One,
            3,
            "Compile regulatory and patent information for {drug_name}. Include: FDA approval \
             date and indications, EMA and other approvals, patent expiration dates by region, \
             data exclusivity periods, generic entry forecasts, regulatory exclusivities, and \
             patent litigation status.",
            vec![
                ValidationRule::RequiredSection { keyword: "patent".into() },
                ValidationRule::RequiredSection { keyword: "approval".into() },
                ValidationRule::MinNumericValues { count: 2 },
            ],
            &["approvals", "patents", "exclusivities"],
        ),
        category(
            4,
            "Commercial Opportunities",
            "commercial_opportunities",
            Phase::One,
            4,
            "Identify commercial opportunities for {drug_name}. Include: unmet medical needs, \
             potential new indications, underserved populations, geographic expansion, \
             partnership or licensing opportunities, and value-based contracting potential.",
            vec![ValidationRule::MinSectionCount { count: 2 }],
            &["opportunities", "partnerships"],
        ),
        category(
            5,
            "Current Formulations",
            "current_formulations",
            Phase::One,
            5,
            "Detail all current formulations of {drug_name}. Include: available dosage forms, \
             strengths and concentrations, excipients, storage and stability, manufacturing \
             sites, and bioequivalence data for generics.",
            vec![
                ValidationRule::RequiredSection { keyword: "formulation".into() },
                ValidationRule::MinSectionCount { count: 2 },
            ],
            &["dosage_forms", "strengths"],
        ),
        category(
            6,
            "Investigational Formulations",
            "investigational_formulations",
            Phase::One,
            6,
            "Research investigational formulations and delivery systems for {drug_name}. \
             Include: new formulations in clinical trials, novel delivery systems such as \
             extended release and patches, fixed-dose combinations, pediatric or geriatric \
             formulations, and development timelines.",
            vec![ValidationRule::MinSectionCount { count: 2 }],
            &["investigational", "delivery_systems"],
        ),
        category(
            7,
            "Physicochemical Profile",
            "physicochemical_profile",
            Phase::One,
            7,
            "Provide physicochemical properties of {drug_name}. Include: molecular weight and \
             formula, LogP and LogD, solubility profile, pKa values, melting point and \
             polymorphs, BCS classification, permeability data, and chemical stability.",
            vec![
                ValidationRule::RequiredSection { keyword: "molecular weight".into() },
                ValidationRule::MinNumericValues { count: 3 },
            ],
            &["molecular_weight", "log_p", "melting_point", "solubility"],
        ),
        category(
            8,
            "Pharmacokinetics",
            "pharmacokinetics",
            Phase::One,
            8,
            "Analyze the pharmacokinetic profile of {drug_name}. Include: absorption (Tmax, \
             bioavailability), distribution (Vd, protein binding), metabolism (CYP enzymes, \
             metabolites), elimination (half-life, clearance), special populations, drug-drug \
             interactions, and food effects.",
            vec![
                ValidationRule::RequiredSection { keyword: "absorption".into() },
                ValidationRule::MinNumericValues { count: 2 },
            ],
            &["absorption", "distribution", "metabolism", "elimination"],
        ),
        category(
            9,
            "Dosage Forms",
            "dosage_forms",
            Phase::One,
            9,
            "Compile dosage and administration information for {drug_name}. Include: approved \
             dosing regimens by indication, dose adjustments for special populations, maximum \
             daily doses, loading and maintenance doses, titration schedules, and \
             administration instructions.",
            vec![
                ValidationRule::RequiredSection { keyword: "dose".into() },
                ValidationRule::MinNumericValues { count: 2 },
            ],
            &["regimens", "max_daily_dose"],
        ),
        category(
            10,
            "Clinical Trials & Safety",
            "clinical_trials_and_safety",
            Phase::One,
            10,
            "Analyze clinical trials and the safety profile for {drug_name}. Include: pivotal \
             trial results with efficacy endpoints, ongoing trials, common adverse events, \
             serious adverse events and black box warnings, REMS requirements, and \
             post-marketing surveillance findings.",
            vec![
                ValidationRule::RequiredSection { keyword: "trial".into() },
                ValidationRule::MinSectionCount { count: 2 },
            ],
            &["pivotal_trials", "adverse_events"],
        ),
        category(
            11,
            "Parameter-Based Scoring",
            "parameter_based_scoring",
            Phase::Two,
            11,
            "Generate the parameter-based suitability scoring for {drug_name} from the Phase 1 \
             data: dose, molecular weight, melting point, and log P mapped to the delivery \
             rubric with weighted totals per route.",
            vec![],
            &[],
        ),
        category(
            12,
            "Weighted Scoring Assessment",
            "weighted_scoring_assessment",
            Phase::Two,
            12,
            "Create a weighted assessment for {drug_name} combining commercial, technical, \
             regulatory, and competitive factors with a sensitivity analysis over the \
             parameter-based scores.",
            vec![],
            &[],
        ),
        category(
            13,
            "Go/No-Go Verdict",
            "go_no_go_verdict",
            Phase::Two,
            13,
            "Generate a Go/No-Go recommendation for {drug_name} considering market size \
             thresholds, regulatory probability, competitive sustainability, technical \
             feasibility, and financial projections, with top supporting reasons and risks.",
            vec![],
            &[],
        ),
        category(
            14,
            "Executive Summary",
            "executive_summary",
            Phase::Two,
            14,
            "Synthesize an executive summary for {drug_name} suitable for C-suite review: \
             investment thesis, key value drivers, critical risks and mitigations, financial \
             highlights, and recommended next steps. Maximum 500 words.",
            vec![],
            &[],
        ),
        category(
            15,
            "Risk Assessment",
            "risk_assessment",
            Phase::Two,
            15,
            "Conduct a risk assessment for {drug_name} across regulatory, commercial, \
             technical, financial, and strategic categories, rating each High/Medium/Low with \
             mitigation strategies.",
            vec![],
            &[],
        ),
        category(
            16,
            "Strategic Recommendations",
            "strategic_recommendations",
            Phase::Two,
            16,
            "Provide strategic recommendations for {drug_name}: development strategy, \
             partnership recommendations, market entry by region, pricing and access strategy, \
             and a 12-24 month roadmap.",
            vec![],
            &[],
        ),
        category(
            17,
            "Investment Analysis",
            "investment_analysis",
            Phase::Two,
            17,
            "Perform an investment analysis for {drug_name}: NPV with assumptions, IRR, peak \
             sales projections, break-even analysis, ROI scenarios, and a valuation range with \
             bull, base, and bear cases.",
            vec![],
            &[],
        ),
    ]
}

/// Default dependency edges.
///
/// The scorer (11) requires the physicochemical profile; the narrative
/// Phase-2 categories consume the scorer's output.
pub fn default_dependencies() -> Vec<CategoryDependency> {
    let mut edges = vec![CategoryDependency {
        dependent_id: 11,
        required_id: 7,
    }];
    for dependent_id in 12..=17 {
        edges.push(CategoryDependency {
            dependent_id,
            required_id: 11,
        });
    }
    edges
}

/// Reject dependency graphs containing cycles.
pub fn validate_acyclic(dependencies: &[CategoryDependency]) -> Result<()> {
    let mut adjacency: HashMap<i64, Vec<i64>> = HashMap::new();
    for edge in dependencies {
        adjacency
            .entry(edge.dependent_id)
            .or_default()
            .push(edge.required_id);
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        node: i64,
        adjacency: &HashMap<i64, Vec<i64>>,
        marks: &mut HashMap<i64, Mark>,
    ) -> Result<()> {
        match marks.get(&node) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(Error::DependencyCycle(node.to_string())),
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        if let Some(required) = adjacency.get(&node) {
            for &next in required {
                visit(next, adjacency, marks)?;
            }
        }
        marks.insert(node, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for &node in adjacency.keys() {
        visit(node, &adjacency, &mut marks)?;
    }
    Ok(())
}

/// Requirements of `category_id` that are not in the `satisfied` set.
///
/// Used both for enable-time gating (satisfied = enabled ids) and run-time
/// gating (satisfied = completed ids).
pub fn unmet_requirements(
    category_id: i64,
    dependencies: &[CategoryDependency],
    satisfied: &HashSet<i64>,
) -> Vec<i64> {
    dependencies
        .iter()
        .filter(|e| e.dependent_id == category_id && !satisfied.contains(&e.required_id))
        .map(|e| e.required_id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_shape() {
        let categories = default_categories();
        assert_eq!(categories.len(), 17);
        assert_eq!(
            categories.iter().filter(|c| c.phase == Phase::One).count(),
            10
        );
        assert_eq!(
            categories.iter().filter(|c| c.phase == Phase::Two).count(),
            7
        );

        // Display order is unique and the scorer is first among Phase 2.
        let mut orders: Vec<i64> = categories.iter().map(|c| c.display_order).collect();
        orders.sort_unstable();
        orders.dedup();
        assert_eq!(orders.len(), 17);

        let scorer = categories
            .iter()
            .filter(|c| c.phase == Phase::Two)
            .min_by_key(|c| c.display_order)
            .unwrap();
        assert_eq!(scorer.key, "parameter_based_scoring");
    }

    #[test]
    fn test_prompt_rendering() {
        let categories = default_categories();
        let prompt = categories[0].render_prompt("Apixaban");
        assert!(prompt.contains("Apixaban"));
        assert!(!prompt.contains("{drug_name}"));
    }

    #[test]
    fn test_default_dependencies_acyclic() {
        validate_acyclic(&default_dependencies()).unwrap();
    }

    #[test]
    fn test_cycle_detected() {
        let edges = vec![
            CategoryDependency {
                dependent_id: 1,
                required_id: 2,
            },
            CategoryDependency {
                dependent_id: 2,
                required_id: 3,
            },
            CategoryDependency {
                dependent_id: 3,
                required_id: 1,
            },
        ];
        assert!(matches!(
            validate_acyclic(&edges),
            Err(Error::DependencyCycle(_))
        ));
    }

    #[test]
    fn test_unmet_requirements() {
        let deps = default_dependencies();
        let mut satisfied: HashSet<i64> = (1..=10).collect();
        assert!(unmet_requirements(11, &deps, &satisfied).is_empty());
        // Narrative phase-2 categories require the scorer.
        assert_eq!(unmet_requirements(14, &deps, &satisfied), vec![11]);
        satisfied.insert(11);
        assert!(unmet_requirements(14, &deps, &satisfied).is_empty());
    }

    #[test]
    fn test_unmet_requirement_when_profile_disabled() {
        let deps = default_dependencies();
        let satisfied: HashSet<i64> = (1..=10).filter(|&id| id != 7).collect();
        assert_eq!(unmet_requirements(11, &deps, &satisfied), vec![7]);
    }
}
