//! Transaction classifier — ordered rule table mapping a message to an effect.
//!
//! Rules are checked in table order and the first full match wins:
//! - sender domain contains `sender_domain`
//! - subject contains `subject_contains`
//! - body contains `body_contains` (when set)
//! - the subject amount falls inside `amount_band` (when set)
//!
//! All text matching is case-insensitive substring matching. Anything that
//! matches nothing classifies to `None`, which is the common case.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;
use crate::pipeline::message::sender_domain;
use crate::pipeline::types::{ArtifactSource, Effect};

/// `$<digits>` with optional two-digit cents.
static AMOUNT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(\d+(?:\.\d{2})?)").expect("amount pattern is a valid regex")
});

/// Placeholder substituted into patch titles.
const AMOUNT_PLACEHOLDER: &str = "{amount}";

/// Inclusive sanity bounds for an extracted amount. Zero and negative
/// amounts never pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountBand {
    #[serde(default)]
    pub min: Decimal,
    #[serde(default)]
    pub max: Option<Decimal>,
}

impl AmountBand {
    pub fn between(min: Decimal, max: Decimal) -> Self {
        Self {
            min,
            max: Some(max),
        }
    }

    pub fn positive() -> Self {
        Self {
            min: Decimal::ZERO,
            max: None,
        }
    }

    pub fn contains(&self, amount: Decimal) -> bool {
        amount > Decimal::ZERO
            && amount >= self.min
            && self.max.is_none_or(|max| amount <= max)
    }
}

/// One row of the rule table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRule {
    /// Label used in logs.
    pub name: String,
    pub sender_domain: String,
    pub subject_contains: String,
    #[serde(default)]
    pub body_contains: Option<String>,
    #[serde(default)]
    pub amount_band: Option<AmountBand>,
    /// Effect to emit. Patch titles may contain `{amount}`.
    pub effect: Effect,
}

impl TransactionRule {
    fn delete(
        name: &str,
        sender: &str,
        subject: &str,
        body: Option<&str>,
        prefix: &str,
        month_offset: u32,
    ) -> Self {
        Self {
            name: name.into(),
            sender_domain: sender.into(),
            subject_contains: subject.into(),
            body_contains: body.map(String::from),
            amount_band: None,
            effect: Effect::DeleteEvents {
                title_prefix: prefix.into(),
                month_offset,
            },
        }
    }

    fn archive(
        name: &str,
        sender: &str,
        subject: &str,
        source: ArtifactSource,
        folder: &str,
    ) -> Self {
        Self {
            name: name.into(),
            sender_domain: sender.into(),
            subject_contains: subject.into(),
            body_contains: None,
            amount_band: None,
            effect: Effect::ArchiveArtifact {
                source,
                folder_path: folder.into(),
            },
        }
    }

    fn with_band(mut self, band: AmountBand) -> Self {
        self.amount_band = Some(band);
        self
    }

    /// Lowercase every pattern once so matching only lowercases the input.
    fn normalized(mut self) -> Self {
        self.sender_domain = self.sender_domain.to_lowercase();
        self.subject_contains = self.subject_contains.to_lowercase();
        self.body_contains = self.body_contains.map(|b| b.to_lowercase());
        self
    }

    fn needs_amount(&self) -> bool {
        self.amount_band.is_some()
            || matches!(
                &self.effect,
                Effect::PatchEvents { new_title, .. } if new_title.contains(AMOUNT_PLACEHOLDER)
            )
    }
}

/// First `$` amount in `text`.
pub fn extract_amount(text: &str) -> Option<Decimal> {
    let caps = AMOUNT_PATTERN.captures(text)?;
    caps.get(1)?.as_str().parse().ok()
}

/// Ordered rule table.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<TransactionRule>,
}

impl Classifier {
    pub fn new(rules: Vec<TransactionRule>) -> Self {
        Self {
            rules: rules.into_iter().map(TransactionRule::normalized).collect(),
        }
    }

    /// Built-in rule table.
    pub fn default_rules() -> Self {
        let withdrawal = "withdrawal notice";
        let rules = vec![
            // One bank alert, four payees told apart by the body.
            TransactionRule::delete(
                "capitalone-att",
                "capitalone.com",
                withdrawal,
                Some("ATT has initiated"),
                "Pay AT&T",
                0,
            ),
            TransactionRule::delete(
                "capitalone-state-farm",
                "capitalone.com",
                withdrawal,
                Some("State Farm has initiated"),
                "Pay State Farm",
                0,
            ),
            TransactionRule::delete(
                "capitalone-verizon",
                "capitalone.com",
                withdrawal,
                Some("Verizon has initiated"),
                "Pay Verizon",
                0,
            ),
            TransactionRule::delete(
                "capitalone-geico",
                "capitalone.com",
                withdrawal,
                Some("GEICO has initiated"),
                "Pay Geico",
                1,
            ),
            TransactionRule::delete(
                "xfinity-charge",
                "capitalone.com",
                "transaction with comcast / xfinity",
                None,
                "Pay Xfinity",
                0,
            )
            .with_band(AmountBand::between(dec!(100), dec!(200))),
            TransactionRule {
                name: "pge-statement".into(),
                sender_domain: "pge.com".into(),
                subject_contains: "statement is ready".into(),
                body_contains: None,
                amount_band: Some(AmountBand::positive()),
                effect: Effect::PatchEvents {
                    title_prefix: "Pay PG&E".into(),
                    month_offset: 1,
                    new_title: "Pay PG&E ${amount}".into(),
                },
            },
            TransactionRule::archive(
                "water-bill",
                "sfwater.org",
                "water bill",
                ArtifactSource::Attachment {
                    mime_type: "application/pdf".into(),
                },
                "Bills/Water",
            ),
            TransactionRule::archive(
                "electric-portal",
                "sce.com",
                "your bill is ready",
                ArtifactSource::BillPortal,
                "Bills/Electric",
            ),
        ];
        Self::new(rules)
    }

    /// Parse a JSON array of rules.
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        let rules: Vec<TransactionRule> =
            serde_json::from_str(json).map_err(|e| PipelineError::Rules(e.to_string()))?;
        Ok(Self::new(rules))
    }

    /// Load the rule table from a JSON file.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Rules(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn rules(&self) -> &[TransactionRule] {
        &self.rules
    }

    /// First matching rule's effect, with any `{amount}` already rendered.
    pub fn classify(&self, sender: &str, subject: &str, body: &str) -> Option<Effect> {
        let domain = sender_domain(sender);
        let subject_lc = subject.to_lowercase();
        let body_lc = body.to_lowercase();

        for rule in &self.rules {
            if !domain.contains(&rule.sender_domain)
                || !subject_lc.contains(&rule.subject_contains)
            {
                continue;
            }
            if let Some(needle) = &rule.body_contains {
                if !body_lc.contains(needle) {
                    continue;
                }
            }

            let amount = if rule.needs_amount() {
                let Some(amount) = extract_amount(subject) else {
                    debug!(rule = %rule.name, subject, "Rule needs an amount but subject has none");
                    continue;
                };
                if let Some(band) = &rule.amount_band {
                    if !band.contains(amount) {
                        debug!(rule = %rule.name, %amount, "Amount outside rule band");
                        continue;
                    }
                }
                Some(amount)
            } else {
                None
            };

            debug!(rule = %rule.name, effect = rule.effect.label(), "Message matched rule");
            return Some(render(&rule.effect, amount));
        }

        None
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::default_rules()
    }
}

fn render(effect: &Effect, amount: Option<Decimal>) -> Effect {
    match (effect, amount) {
        (
            Effect::PatchEvents {
                title_prefix,
                month_offset,
                new_title,
            },
            Some(amount),
        ) => Effect::PatchEvents {
            title_prefix: title_prefix.clone(),
            month_offset: *month_offset,
            new_title: new_title.replace(AMOUNT_PLACEHOLDER, &format!("{:.2}", amount.round_dp(2))),
        },
        _ => effect.clone(),
    }
}
