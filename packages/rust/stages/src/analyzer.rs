//! Analyzer: scores raw articles against the developer keyword list and
//! writes an extractive summary.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;

use ravedigest_shared::{
    AnalyzerConfig, EnrichedArticle, Message, Payload, RawArticle, Result,
};
use ravedigest_worker::Transform;

/// Summaries are cut to this many characters.
const MAX_SUMMARY_CHARS: usize = 600;

pub struct Analyzer {
    /// Normalized keywords, see [`normalize`].
    keywords: Vec<String>,
    summary_sentences: usize,
}

impl Analyzer {
    pub fn new(keywords: &[String], summary_sentences: usize) -> Self {
        Self {
            keywords: keywords
                .iter()
                .map(|k| normalize(k))
                .filter(|k| !k.is_empty())
                .collect(),
            summary_sentences: summary_sentences.max(1),
        }
    }

    pub fn from_config(config: &AnalyzerConfig) -> Self {
        Self::new(&config.keywords, config.summary_sentences)
    }

    /// Score and summarize one article.
    pub fn analyze(&self, raw: RawArticle) -> EnrichedArticle {
        let title = format!(" {} ", normalize(&raw.title));
        let body = format!(" {} ", normalize(&raw.summary));

        let mut in_title = BTreeSet::new();
        let mut in_body = BTreeSet::new();
        for kw in &self.keywords {
            let needle = format!(" {kw} ");
            if title.contains(&needle) {
                in_title.insert(kw.as_str());
            }
            if body.contains(&needle) {
                in_body.insert(kw.as_str());
            }
        }

        let matched = in_title.union(&in_body).count();
        // 2 points per distinct keyword, 1 extra when it is in the title
        let raw_score = matched as f64 * 2.0 + in_title.len() as f64;
        let relevance_score = (raw_score.min(10.0) * 10.0).round() / 10.0;

        let summary = summarize(&raw.summary, self.summary_sentences)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| raw.title.clone());

        EnrichedArticle {
            article: RawArticle { summary, ..raw },
            relevance_score,
            developer_focus: matched > 0,
        }
    }
}

impl Transform for Analyzer {
    fn apply<'a>(
        &'a self,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Payload>>> + Send + 'a>> {
        Box::pin(async move {
            let raw = RawArticle::from_payload(&message.payload)?;
            let enriched = self.analyze(raw);
            tracing::debug!(
                id = %message.id,
                score = enriched.relevance_score,
                developer_focus = enriched.developer_focus,
                "article analyzed"
            );
            Ok(Some(enriched.to_payload()))
        })
    }
}

/// Lowercase, non-alphanumerics to single spaces.
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// First `sentences` sentences of `text`, capped at [`MAX_SUMMARY_CHARS`].
fn summarize(text: &str, sentences: usize) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let mut end = text.len();
    let mut found = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().is_none_or(|(_, next)| next.is_whitespace());
            if at_boundary {
                found += 1;
                if found == sentences {
                    end = i + c.len_utf8();
                    break;
                }
            }
        }
    }

    let mut summary = text[..end].trim().to_string();
    if summary.chars().count() > MAX_SUMMARY_CHARS {
        summary = summary.chars().take(MAX_SUMMARY_CHARS).collect::<String>();
        summary.push_str("...");
    }
    Some(summary)
}
