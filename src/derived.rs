//! Derived metrics: urgency, tone, subjectivity, intent, emotion, topics
//!
//! Every rule runs independently. A rule that cannot run with its parameters
//! is listed in `omitted` with a reason; the other rules and the primary label
//! are unaffected.

use crate::provider::{phrase_hits, tokenize};
use crate::types::{
    DerivedMetricRules, DerivedMetrics, EmotionRule, IntentRule, KeywordRules, OmittedMetric,
    SentimentLabel, Tone, ToneRule, UrgencyRule,
};

type RuleResult<T> = Result<T, String>;

const NEGATIVE_URGENCY_BOOST: f64 = 0.2;

const FIRST_PERSON: &[&str] = &["i", "i'm", "i've", "me", "my", "mine", "we", "our", "us"];

const OPINION_WORDS: &[&str] = &[
    "think", "feel", "believe", "love", "hate", "like", "dislike", "great", "terrible", "awful",
    "amazing", "bad", "good", "best", "worst", "horrible", "excellent", "disappointed", "happy",
];

const FRIENDLY_MARKERS: &[&str] = &["thanks", "thank", "please", "appreciate", "cheers", "awesome"];

const FORMAL_MARKERS: &[&str] = &["regards", "sincerely", "dear", "kindly", "hereby", "furthermore"];

const EMOTIONS: &[(&str, &[&str])] = &[
    ("joy", &["happy", "glad", "love", "delighted", "great", "awesome", "excited", "pleased"]),
    ("anger", &["angry", "furious", "outraged", "hate", "ridiculous", "unacceptable", "mad"]),
    ("sadness", &["sad", "disappointed", "unhappy", "sorry", "upset", "miss", "unfortunately"]),
    ("fear", &["worried", "afraid", "scared", "concerned", "nervous", "anxious"]),
    ("surprise", &["surprised", "shocked", "unexpected", "wow", "amazed"]),
];

/// Text prepared once for all rules
struct Scanned<'a> {
    text: &'a str,
    lowered: String,
    tokens: Vec<String>,
}

impl<'a> Scanned<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            lowered: text.to_lowercase(),
            tokens: tokenize(text),
        }
    }

    fn hits(&self, phrase: &str) -> u32 {
        phrase_hits(&self.tokens, &self.lowered, phrase)
    }

    fn hits_any(&self, phrases: &[String]) -> u32 {
        phrases.iter().map(|p| self.hits(p)).sum()
    }

    fn count_words(&self, words: &[&str]) -> usize {
        self.tokens.iter().filter(|t| words.contains(&t.as_str())).count()
    }
}

pub fn compute(
    text: &str,
    label: SentimentLabel,
    low_confidence: bool,
    rules: &DerivedMetricRules,
    keywords: &KeywordRules,
) -> DerivedMetrics {
    let scanned = Scanned::new(text);
    let mut out = DerivedMetrics {
        low_confidence,
        ..Default::default()
    };

    if let Some(rule) = rules.urgency.as_ref().filter(|r| r.enabled) {
        out.urgency = record(&mut out.omitted, "urgency", urgency(&scanned, label, rule));
    }
    if let Some(rule) = rules.tone.as_ref().filter(|r| r.enabled) {
        out.tone = record(&mut out.omitted, "tone", tone(&scanned, label, rule));
    }
    if rules.subjectivity.as_ref().is_some_and(|r| r.enabled) {
        out.subjectivity = record(&mut out.omitted, "subjectivity", subjectivity(&scanned, keywords));
    }
    if let Some(rule) = rules.intent.as_ref().filter(|r| r.enabled) {
        out.intent = record(&mut out.omitted, "intent", intent(&scanned, rule, keywords)).flatten();
    }
    if let Some(rule) = rules.emotion.as_ref().filter(|r| r.enabled) {
        out.emotion = record(&mut out.omitted, "emotion", emotion(&scanned, rule)).flatten();
    }
    if rules.topics.as_ref().is_some_and(|r| r.enabled) {
        out.topics = record(&mut out.omitted, "topics", topics(&scanned, keywords));
    }

    out
}

fn record<T>(omitted: &mut Vec<OmittedMetric>, metric: &str, result: RuleResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(reason) => {
            tracing::debug!(metric, reason = %reason, "derived metric omitted");
            omitted.push(OmittedMetric {
                metric: metric.to_string(),
                reason,
            });
            None
        }
    }
}

fn urgency(scanned: &Scanned<'_>, label: SentimentLabel, rule: &UrgencyRule) -> RuleResult<f64> {
    if !(rule.weight_per_hit > 0.0 && rule.weight_per_hit <= 1.0) {
        return Err(format!("weight_per_hit {} outside (0,1]", rule.weight_per_hit));
    }
    if rule.keywords.is_empty() {
        return Err("no urgency keywords configured".to_string());
    }

    let hits = scanned.hits_any(&rule.keywords) as f64;
    let mut value = (hits * rule.weight_per_hit).min(1.0);
    if label == SentimentLabel::Negative {
        value = (value + NEGATIVE_URGENCY_BOOST).min(1.0);
    }
    Ok(value)
}

fn tone(scanned: &Scanned<'_>, label: SentimentLabel, rule: &ToneRule) -> RuleResult<Tone> {
    if !(0.0..=1.0).contains(&rule.caps_ratio_threshold) {
        return Err(format!(
            "caps_ratio_threshold {} outside [0,1]",
            rule.caps_ratio_threshold
        ));
    }

    let letters = scanned.text.chars().filter(|c| c.is_alphabetic()).count();
    let upper = scanned.text.chars().filter(|c| c.is_uppercase()).count();
    let caps_ratio = if letters == 0 {
        0.0
    } else {
        upper as f64 / letters as f64
    };
    let shouting = letters >= 4 && caps_ratio >= rule.caps_ratio_threshold;
    let exclamations = scanned.text.matches('!').count();

    let tone = match label {
        SentimentLabel::Negative if shouting || exclamations >= 2 => Tone::Angry,
        SentimentLabel::Negative => Tone::Frustrated,
        _ if scanned.count_words(FRIENDLY_MARKERS) > 0 => Tone::Friendly,
        SentimentLabel::Positive if exclamations > 0 => Tone::Friendly,
        _ if scanned.count_words(FORMAL_MARKERS) > 0 => Tone::Formal,
        _ => Tone::Neutral,
    };
    Ok(tone)
}

fn subjectivity(scanned: &Scanned<'_>, keywords: &KeywordRules) -> RuleResult<f64> {
    if scanned.tokens.is_empty() {
        return Err("no words to score".to_string());
    }

    let lexical = scanned.count_words(FIRST_PERSON) + scanned.count_words(OPINION_WORDS);
    let configured = scanned
        .tokens
        .iter()
        .filter(|t| !OPINION_WORDS.contains(&t.as_str()))
        .filter(|t| keywords.positive.contains(*t) || keywords.negative.contains(*t))
        .count();

    Ok(((lexical + configured) as f64 / scanned.tokens.len() as f64).min(1.0))
}

/// Name with the most hits; ties go to the first name in order
fn best_match<'k, I>(scanned: &Scanned<'_>, candidates: I) -> Option<String>
where
    I: IntoIterator<Item = (&'k str, &'k [String])>,
{
    let mut best: Option<(&str, u32)> = None;
    for (name, phrases) in candidates {
        let hits = scanned.hits_any(phrases);
        if hits > 0 && best.map_or(true, |(_, h)| hits > h) {
            best = Some((name, hits));
        }
    }
    best.map(|(name, _)| name.to_string())
}

fn intent(
    scanned: &Scanned<'_>,
    rule: &IntentRule,
    keywords: &KeywordRules,
) -> RuleResult<Option<String>> {
    if !rule.intents.is_empty() {
        let candidates = rule.intents.iter().map(|(k, v)| (k.as_str(), v.as_slice()));
        return Ok(best_match(scanned, candidates));
    }

    let mut candidates = keywords
        .pure_intents()
        .map(|(k, v)| (k.as_str(), v.as_slice()))
        .peekable();
    if candidates.peek().is_none() {
        return Err("no intents configured".to_string());
    }
    Ok(best_match(scanned, candidates))
}

fn emotion(scanned: &Scanned<'_>, rule: &EmotionRule) -> RuleResult<Option<String>> {
    if !rule.lexicon.is_empty() {
        if rule.lexicon.values().all(Vec::is_empty) {
            return Err("emotion lexicon has no words".to_string());
        }
        let candidates = rule.lexicon.iter().map(|(k, v)| (k.as_str(), v.as_slice()));
        return Ok(best_match(scanned, candidates));
    }

    let builtin: Vec<(&str, Vec<String>)> = EMOTIONS
        .iter()
        .map(|(name, words)| (*name, words.iter().map(|w| w.to_string()).collect()))
        .collect();
    Ok(best_match(
        scanned,
        builtin.iter().map(|(k, v)| (*k, v.as_slice())),
    ))
}

fn topics(scanned: &Scanned<'_>, keywords: &KeywordRules) -> RuleResult<Vec<String>> {
    let mut configured = false;
    let mut found = Vec::new();
    for (topic, phrases) in keywords.topics() {
        configured = true;
        if scanned.hits_any(phrases) > 0 {
            found.push(topic.to_string());
        }
    }
    if !configured {
        return Err("no topic: keywords configured".to_string());
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SubjectivityRule, TopicRule};
    use std::collections::BTreeMap;

    fn all_rules() -> DerivedMetricRules {
        DerivedMetricRules {
            urgency: Some(UrgencyRule {
                enabled: true,
                keywords: vec!["urgent".into(), "asap".into(), "right now".into()],
                weight_per_hit: 0.25,
            }),
            tone: Some(ToneRule {
                enabled: true,
                caps_ratio_threshold: 0.6,
            }),
            subjectivity: Some(SubjectivityRule { enabled: true }),
            intent: Some(IntentRule {
                enabled: true,
                intents: BTreeMap::new(),
            }),
            emotion: Some(EmotionRule {
                enabled: true,
                lexicon: BTreeMap::new(),
            }),
            topics: Some(TopicRule { enabled: true }),
        }
    }

    fn keywords() -> KeywordRules {
        let mut k = KeywordRules::default();
        k.intents.insert("cancel".into(), vec!["cancel".into(), "close my account".into()]);
        k.intents.insert("billing".into(), vec!["invoice".into(), "charge".into()]);
        k.intents.insert("topic:shipping".into(), vec!["delivery".into(), "package".into()]);
        k.intents.insert("topic:pricing".into(), vec!["price".into()]);
        k
    }

    #[test]
    fn test_all_rules_on_angry_message() {
        let m = compute(
            "THIS IS URGENT, CANCEL MY ORDER, THE PACKAGE NEVER ARRIVED!!",
            SentimentLabel::Negative,
            false,
            &all_rules(),
            &keywords(),
        );
        assert!(m.omitted.is_empty(), "{:?}", m.omitted);
        assert!((m.urgency.unwrap() - 0.45).abs() < 1e-9);
        assert_eq!(m.tone, Some(Tone::Angry));
        assert_eq!(m.intent.as_deref(), Some("cancel"));
        assert_eq!(m.topics, Some(vec!["shipping".to_string()]));
        assert!(!m.low_confidence);
    }

    #[test]
    fn test_failing_rule_is_omitted_not_zeroed() {
        let mut rules = all_rules();
        if let Some(u) = rules.urgency.as_mut() {
            u.weight_per_hit = 3.0;
        }
        let m = compute("asap please", SentimentLabel::Neutral, true, &rules, &keywords());
        assert!(m.urgency.is_none());
        assert!(m.is_omitted("urgency"));
        assert!(!m.is_omitted("tone"));
        assert_eq!(m.tone, Some(Tone::Friendly));
        assert!(m.low_confidence);
    }

    #[test]
    fn test_intent_and_topics_need_configuration() {
        let m = compute(
            "where is my invoice",
            SentimentLabel::Neutral,
            false,
            &all_rules(),
            &KeywordRules::default(),
        );
        assert!(m.is_omitted("intent"));
        assert!(m.is_omitted("topics"));
        assert!(m.subjectivity.is_some());
    }

    #[test]
    fn test_subjectivity_omitted_on_empty_text() {
        let m = compute("  ", SentimentLabel::Neutral, false, &all_rules(), &keywords());
        assert!(m.is_omitted("subjectivity"));
    }

    #[test]
    fn test_emotion_builtin_and_custom() {
        let m = compute(
            "I am so worried and scared about this",
            SentimentLabel::Negative,
            false,
            &all_rules(),
            &keywords(),
        );
        assert_eq!(m.emotion.as_deref(), Some("fear"));

        let mut rules = all_rules();
        let mut lexicon = BTreeMap::new();
        lexicon.insert("gratitude".to_string(), vec!["thanks".to_string()]);
        rules.emotion = Some(EmotionRule {
            enabled: true,
            lexicon,
        });
        let m = compute("thanks a lot", SentimentLabel::Positive, false, &rules, &keywords());
        assert_eq!(m.emotion.as_deref(), Some("gratitude"));
    }

    #[test]
    fn test_disabled_rules_are_absent() {
        let m = compute(
            "urgent",
            SentimentLabel::Negative,
            false,
            &DerivedMetricRules::default(),
            &keywords(),
        );
        assert_eq!(m, DerivedMetrics::default());
    }

    #[test]
    fn test_formal_tone() {
        let m = compute(
            "Dear team, kindly review the attached. Regards",
            SentimentLabel::Neutral,
            false,
            &all_rules(),
            &keywords(),
        );
        assert_eq!(m.tone, Some(Tone::Formal));
    }
}
