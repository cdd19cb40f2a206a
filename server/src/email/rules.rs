//! Deterministic keyword/pattern classifier used when the oracle is unavailable.
//!
//! Categories are tried in a fixed order and the first one with at least one
//! matching pattern wins. Confidence grows with the number of matches:
//! `min(0.6 + 0.15 * matches, 0.95)`. Text matching nothing is
//! `Uncategorized` with confidence 0.3.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::mail_record::{Category, EmailText, MailRecord};

const BASE_CONFIDENCE: f32 = 0.6;
const CONFIDENCE_PER_MATCH: f32 = 0.15;
const MAX_CONFIDENCE: f32 = 0.95;
const NO_MATCH_CONFIDENCE: f32 = 0.3;

struct CategoryPatterns {
    category: Category,
    patterns: Vec<Regex>,
}

fn compile(category: Category, patterns: &[&str]) -> CategoryPatterns {
    CategoryPatterns {
        category,
        patterns: patterns
            .iter()
            .map(|p| Regex::new(p).unwrap_or_else(|e| panic!("invalid rule pattern {p}: {e}")))
            .collect(),
    }
}

static RULES: Lazy<Vec<CategoryPatterns>> = Lazy::new(|| {
    vec![
        compile(
            Category::OutOfOffice,
            &[
                r"out of (the )?office",
                r"away from",
                r"on vacation",
                r"auto[\s-]?reply",
                r"automatic reply",
                r"currently unavailable",
                r"will be back",
                r"away until",
                r"i am away",
            ],
        ),
        compile(
            Category::MeetingBooked,
            &[
                r"meeting confirmed",
                r"calendar invite",
                r"accepted.*invite",
                r"booked",
                r"scheduled",
                r"see you on",
                r"meeting link",
                r"zoom link",
                r"confirmed.*meeting",
                r"looking forward to our",
            ],
        ),
        compile(
            Category::NotInterested,
            &[
                r"not interested",
                r"no thank",
                r"unsubscribe",
                r"remove me",
                r"don'?t contact",
                r"not a fit",
                r"not the right time",
                r"pass on this",
                r"no longer interested",
            ],
        ),
        compile(
            Category::Spam,
            &[
                r"click here now",
                r"limited time offer",
                r"act now",
                r"congratulations.{0,3}you.{0,3}won",
                r"verify your account",
                r"urgent action required",
                r"account suspended",
                r"winner",
                r"lottery",
                r"free money",
                r"cryptocurrency",
            ],
        ),
        compile(
            Category::Interested,
            &[
                r"interested",
                r"tell me more",
                r"learn more",
                r"pricing",
                r"demo",
                r"trial",
                r"how does.*work",
                r"can you",
                r"would like to know",
                r"more information",
                r"discuss",
                r"schedule.*call",
                r"available.*talk",
                r"let'?s connect",
            ],
        ),
    ]
});

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleVerdict {
    pub category: Category,
    pub confidence: f32,
    pub matches: usize,
}

/// Score free text against the rule table.
pub fn classify(text: &EmailText) -> RuleVerdict {
    let haystack = [&text.subject, &text.body, &text.from]
        .into_iter()
        .flatten()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    RULES
        .iter()
        .find_map(|rule| {
            let matches = rule.patterns.iter().filter(|p| p.is_match(&haystack)).count();
            (matches > 0).then(|| RuleVerdict {
                category: rule.category,
                confidence: (BASE_CONFIDENCE + CONFIDENCE_PER_MATCH * matches as f32)
                    .min(MAX_CONFIDENCE),
                matches,
            })
        })
        .unwrap_or(RuleVerdict {
            category: Category::Uncategorized,
            confidence: NO_MATCH_CONFIDENCE,
            matches: 0,
        })
}

pub fn classify_record(record: &MailRecord) -> RuleVerdict {
    classify(&EmailText::from(record))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(subject: &str, body: &str) -> EmailText {
        EmailText {
            subject: Some(subject.to_string()),
            body: Some(body.to_string()),
            from: Some("lead@example.com".to_string()),
        }
    }

    #[test]
    fn test_demo_request_is_interested() {
        let verdict = classify(&text(
            "Re: Demo Request",
            "I'm interested in your product. Can we schedule a call?",
        ));
        assert_eq!(verdict.category, Category::Interested);
        assert!(verdict.confidence >= 0.6);
    }

    #[test]
    fn test_away_until_is_out_of_office() {
        let verdict = classify(&EmailText {
            body: Some("I am away until Monday".to_string()),
            ..Default::default()
        });
        assert_eq!(verdict.category, Category::OutOfOffice);
        assert_eq!(verdict.matches, 2);
        assert!((verdict.confidence - 0.9).abs() < 1e-4);
    }

    #[test]
    fn test_first_category_in_order_wins() {
        // "not interested" also matches the Interested pattern "interested"
        let verdict = classify(&text("Re: offer", "Sorry, we are not interested."));
        assert_eq!(verdict.category, Category::NotInterested);
    }

    #[test]
    fn test_confidence_is_capped() {
        let verdict = classify(&text(
            "Pricing and demo",
            "Tell me more, I'd like to learn more about a trial. Can you discuss pricing?",
        ));
        assert_eq!(verdict.category, Category::Interested);
        assert!((verdict.confidence - MAX_CONFIDENCE).abs() < 1e-4);
    }

    #[test]
    fn test_no_match_is_uncategorized() {
        let verdict = classify(&text("Invoice #4411", "Attached is the invoice."));
        assert_eq!(verdict.category, Category::Uncategorized);
        assert!((verdict.confidence - NO_MATCH_CONFIDENCE).abs() < 1e-4);
    }

    #[test]
    fn test_deterministic() {
        let input = text("Congratulations you won", "Claim your lottery prize");
        assert_eq!(classify(&input), classify(&input));
        assert_eq!(classify(&input).category, Category::Spam);
    }
}
