//! Conditional resolution: which questions apply to a given answer set.
//!
//! Applicability depends on submitted data, so it is recomputed on every call
//! and never cached. Until the gateway question is answered only the gateway
//! question itself applies; afterwards every question admitted by the gateway
//! value applies, plus any follow-up whose predicate holds.

use std::collections::BTreeMap;

use crate::survey::{AnswerSet, AnswerValue, Question, SelectOption, ShowIf, Survey};

/// A question that applies, with its options narrowed to the gateway value.
#[derive(Debug, Clone)]
pub struct ApplicableQuestion<'s> {
    pub question: &'s Question,
    /// Options still offered after per-option `applies_to` filtering.
    /// Empty for non-enumerated questions.
    pub options: Vec<&'s SelectOption>,
}

impl ApplicableQuestion<'_> {
    /// An enumerated question whose filtered option list is empty is not
    /// rendered, and therefore cannot be required.
    pub fn is_rendered(&self) -> bool {
        !self.question.kind().is_enumerated() || !self.options.is_empty()
    }

    pub fn allows(&self, value: &str) -> bool {
        self.options.iter().any(|o| o.value == value)
    }
}

/// The applicable question set, keyed by question id.
#[derive(Debug, Clone, Default)]
pub struct Applicable<'s> {
    entries: BTreeMap<&'s str, ApplicableQuestion<'s>>,
    gateway_value: Option<String>,
}

impl<'s> Applicable<'s> {
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&ApplicableQuestion<'s>> {
        self.entries.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'s str, &ApplicableQuestion<'s>)> {
        self.entries.iter().map(|(id, q)| (*id, q))
    }

    pub fn ids(&self) -> impl Iterator<Item = &'s str> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The gateway answer the set was resolved against, if any.
    pub fn gateway_value(&self) -> Option<&str> {
        self.gateway_value.as_deref()
    }

    fn insert(&mut self, question: &'s Question, gateway: Option<&str>) {
        let options = question
            .field()
            .map(|f| {
                f.options
                    .iter()
                    .filter(|o| gateway.is_none_or(|g| o.applies_to.admits(g)))
                    .collect()
            })
            .unwrap_or_default();
        self.entries
            .insert(question.id(), ApplicableQuestion { question, options });
    }
}

/// Compute the applicable question set for the current answers.
pub fn applicable_questions<'s>(survey: &'s Survey, answers: &AnswerSet) -> Applicable<'s> {
    let gateway = survey.gateway();
    let gateway_value = answers
        .text(survey.gateway_field())
        .map(str::trim)
        .filter(|v| !v.is_empty() && gateway.field().is_some_and(|f| f.has_option(v)))
        .map(str::to_string);

    let mut applicable = Applicable {
        entries: BTreeMap::new(),
        gateway_value: gateway_value.clone(),
    };

    let Some(value) = gateway_value else {
        applicable.insert(gateway, None);
        return applicable;
    };

    for question in survey.questions() {
        if question.applies_to().admits(&value) {
            include(question, &value, answers, &mut applicable);
        }
    }
    applicable
}

fn include<'s>(
    question: &'s Question,
    gateway: &str,
    answers: &AnswerSet,
    applicable: &mut Applicable<'s>,
) {
    applicable.insert(question, Some(gateway));
    if let Question::WithFollowUp { parent, follow_up } = question {
        let child = &follow_up.question;
        if child.applies_to().admits(gateway)
            && follow_up.show_if.holds(answers.get(&parent.id), answers)
        {
            include(child, gateway, answers, applicable);
        }
    }
}

impl ShowIf {
    /// Evaluate against the parent's current answer and the full set.
    pub fn holds(&self, parent: Option<&AnswerValue>, answers: &AnswerSet) -> bool {
        match self {
            Self::Equals(expected) => parent.is_some_and(|v| matches_value(v, expected)),
            Self::AnyOf(expected) => {
                parent.is_some_and(|v| expected.iter().any(|e| matches_value(v, e)))
            }
            Self::NotEmpty => parent.is_some_and(|v| !v.is_empty()),
            Self::FieldEquals { field, value } => answers
                .get(field)
                .is_some_and(|v| matches_value(v, value)),
        }
    }
}

fn matches_value(answer: &AnswerValue, expected: &str) -> bool {
    match answer {
        AnswerValue::Text(s) => s == expected,
        AnswerValue::Choices(c) => c.iter().any(|s| s == expected),
        AnswerValue::Number(n) => n.to_string() == expected,
        AnswerValue::Bool(b) => b.to_string() == expected,
        AnswerValue::Null | AnswerValue::Group(_) => false,
    }
}
