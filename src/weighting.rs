//! Source authority weighting.
//!
//! Responses are weighted by a fixed authority hierarchy before merge. The
//! credibility score is a legacy length heuristic kept as one weak signal;
//! the structural validator dominates downstream confidence corrections.

use serde::{Deserialize, Serialize};

use crate::provider::NormalizedResponse;

/// Authority class of a source, with its weight 0..10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceAuthority {
    /// Licensed AI/search APIs.
    LicensedApi,
    Government,
    PeerReviewed,
    Industry,
    Company,
    News,
    Unknown,
}

impl SourceAuthority {
    pub fn weight(&self) -> u8 {
        match self {
            Self::LicensedApi => 10,
            Self::Government => 8,
            Self::PeerReviewed => 6,
            Self::Industry => 4,
            Self::Company => 2,
            Self::News => 1,
            Self::Unknown => 0,
        }
    }

    /// Classify by provider tag first; citation-returning providers fall back
    /// to the domain of the top cited URL.
    pub fn classify(provider: &str, top_citation: Option<&str>) -> Self {
        match provider.to_ascii_lowercase().as_str() {
            "anthropic" | "openai" | "chatgpt" | "grok" | "gemini" | "perplexity" | "tavily" => {
                return Self::LicensedApi
            }
            _ => {}
        }
        match top_citation {
            Some(url) => Self::classify_domain(url),
            None => Self::Unknown,
        }
    }

    fn classify_domain(url: &str) -> Self {
        let host = url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split('/')
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();

        // Journal hosts are checked before the .gov suffix so pubmed/nih
        // classify as peer-reviewed.
        if host.contains("pubmed")
            || host.contains("nih.gov")
            || host.contains("nejm.org")
            || host.contains("thelancet.com")
            || host.contains("sciencedirect")
        {
            Self::PeerReviewed
        } else if host.ends_with(".gov") || host.contains("europa.eu") || host.contains("who.int")
        {
            Self::Government
        } else if host.contains("iqvia")
            || host.contains("evaluate")
            || host.contains("statista")
            || host.contains("drugbank")
        {
            Self::Industry
        } else if host.contains("news")
            || host.contains("reuters")
            || host.contains("fiercepharma")
        {
            Self::News
        } else if host.is_empty() {
            Self::Unknown
        } else {
            Self::Company
        }
    }
}

/// A provider response annotated with its authority weight and credibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedResponse {
    pub response: NormalizedResponse,
    pub authority: SourceAuthority,
    pub weight: u8,
    /// 0..100, `weight * 10`.
    pub authority_score: u16,
    /// Cheap length proxy in 0..1; one signal among many.
    pub credibility: f64,
    pub verified: bool,
}

/// Assign authority weight and credibility to one response.
pub fn weigh(response: NormalizedResponse) -> WeightedResponse {
    let authority =
        SourceAuthority::classify(&response.provider, response.cited_urls.first().map(|s| s.as_str()));
    let weight = authority.weight();
    let credibility = credibility_score(&response.text);
    WeightedResponse {
        authority,
        weight,
        authority_score: weight as u16 * 10,
        credibility,
        verified: weight > 0,
        response,
    }
}

/// `min(1, len/1000)` length heuristic.
pub fn credibility_score(text: &str) -> f64 {
    (text.chars().count() as f64 / 1000.0).min(1.0)
}

/// Average authority score over a set of weighted responses, 0..100.
pub fn average_authority(responses: &[WeightedResponse]) -> f64 {
    if responses.is_empty() {
        return 0.0;
    }
    let total: u32 = responses.iter().map(|r| r.weight as u32).sum();
    total as f64 / responses.len() as f64 * 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn response(provider: &str, text: &str, citations: Vec<&str>) -> NormalizedResponse {
        NormalizedResponse {
            provider: provider.into(),
            model: "m".into(),
            text: text.into(),
            cited_urls: citations.into_iter().map(String::from).collect(),
            input_tokens: 0,
            output_tokens: 0,
            latency_ms: 0,
            cost: 0.0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_licensed_api_weight() {
        for provider in ["anthropic", "openai", "perplexity", "grok", "tavily"] {
            let weighted = weigh(response(provider, "text", vec![]));
            assert_eq!(weighted.weight, 10, "provider {}", provider);
            assert_eq!(weighted.authority_score, 100);
            assert!(weighted.verified);
        }
    }

    #[test]
    fn test_unknown_provider_without_citations() {
        let weighted = weigh(response("mystery", "text", vec![]));
        assert_eq!(weighted.authority, SourceAuthority::Unknown);
        assert_eq!(weighted.weight, 0);
        assert!(!weighted.verified);
    }

    #[test]
    fn test_domain_classification() {
        assert_eq!(
            SourceAuthority::classify("scraper", Some("https://www.fda.gov/drugs")),
            SourceAuthority::Government
        );
        assert_eq!(
            SourceAuthority::classify("scraper", Some("https://pubmed.ncbi.nlm.nih.gov/12345/")),
            SourceAuthority::PeerReviewed
        );
        assert_eq!(
            SourceAuthority::classify("scraper", Some("https://www.iqvia.com/report")),
            SourceAuthority::Industry
        );
        assert_eq!(
            SourceAuthority::classify("scraper", Some("https://www.pfizer.com/product")),
            SourceAuthority::Company
        );
        assert_eq!(
            SourceAuthority::classify("scraper", Some("https://www.fiercepharma.com/story")),
            SourceAuthority::News
        );
    }

    #[test]
    fn test_credibility_is_length_capped() {
        assert_eq!(credibility_score(""), 0.0);
        assert!((credibility_score(&"x".repeat(500)) - 0.5).abs() < 1e-9);
        assert_eq!(credibility_score(&"x".repeat(2000)), 1.0);
    }

    #[test]
    fn test_average_authority() {
        let responses = vec![
            weigh(response("openai", "a", vec![])),
            weigh(response("mystery", "b", vec![])),
        ];
        // (10 + 0) / 2 * 10 = 50
        assert!((average_authority(&responses) - 50.0).abs() < 1e-9);
        assert_eq!(average_authority(&[]), 0.0);
    }
}
